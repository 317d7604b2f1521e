//! Change-feed subscriptions.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use shared::protocol::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeTable, RealtimeCommand, RealtimeFrame,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Events of one subscription. Dropping the stream unsubscribes.
pub struct ChangeStream {
    subscription_id: u64,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeStream {
    pub fn new(
        subscription_id: u64,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subscription_id,
            events,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// `None` once the source has shut down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Next already-queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RealtimeSource: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeStream>;
}

enum Control {
    Subscribe {
        subscription_id: u64,
        filter: ChangeFilter,
        events: mpsc::UnboundedSender<ChangeEvent>,
    },
    Unsubscribe {
        subscription_id: u64,
    },
}

/// [`RealtimeSource`] over the server's `/realtime` websocket.
///
/// One background task owns the socket. It reconnects with exponential
/// backoff and re-registers every live subscription on the new socket.
pub struct WsRealtime {
    control: mpsc::UnboundedSender<Control>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl WsRealtime {
    pub async fn connect(server_url: &str, token: &str) -> ClientResult<Self> {
        let url = realtime_url(server_url, token)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Realtime(format!("failed to connect websocket: {err}")))?;
        info!(host = url.host_str().unwrap_or_default(), "realtime connected");

        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(url, ws, control_rx));
        Ok(Self {
            control,
            next_id: AtomicU64::new(1),
            task,
        })
    }
}

impl Drop for WsRealtime {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl RealtimeSource for WsRealtime {
    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeStream> {
        let subscription_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();
        self.control
            .send(Control::Subscribe {
                subscription_id,
                filter,
                events,
            })
            .map_err(|_| ClientError::Realtime("realtime connection closed".into()))?;
        let control = self.control.clone();
        Ok(ChangeStream::new(subscription_id, rx, move || {
            let _ = control.send(Control::Unsubscribe { subscription_id });
        }))
    }
}

/// `http(s)://host` becomes `ws(s)://host/realtime?token=...`.
pub fn realtime_url(server_url: &str, token: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(ClientError::Realtime(
                "server_url must start with http:// or https://".into(),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Realtime(format!("cannot use {scheme} for {server_url}")))?;
    url.set_path("/realtime");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

type Routes = HashMap<u64, (ChangeFilter, mpsc::UnboundedSender<ChangeEvent>)>;

async fn send_command<S>(sink: &mut S, command: &RealtimeCommand) -> bool
where
    S: Sink<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(command) else {
        return true;
    };
    sink.send(Message::Text(text)).await.is_ok()
}

fn route_frame(text: &str, routes: &mut Routes) {
    match serde_json::from_str::<RealtimeFrame>(text) {
        Ok(RealtimeFrame::Change {
            subscription_id,
            event,
        }) => {
            let closed = match routes.get(&subscription_id) {
                Some((_, events)) => events.send(event).is_err(),
                None => false,
            };
            if closed {
                routes.remove(&subscription_id);
            }
        }
        Ok(RealtimeFrame::Subscribed { subscription_id }) => {
            debug!(subscription_id, "subscription confirmed");
        }
        Ok(RealtimeFrame::Error(err)) => {
            warn!(code = ?err.code, message = %err.message, "realtime error frame");
        }
        Err(err) => warn!(%err, "invalid realtime frame"),
    }
}

/// Stand-ins for whatever a route missed while the socket was down. Each
/// matches the route's filter, so its listener re-reads.
fn resync_events(filter: &ChangeFilter) -> Vec<ChangeEvent> {
    let event = |table, channel_id, message_id| ChangeEvent {
        table,
        kind: ChangeKind::Update,
        channel_id,
        message_id,
        parent_id: None,
        user_id: None,
    };
    match filter {
        ChangeFilter::ChannelMessages { channel_id } => {
            vec![event(ChangeTable::Messages, Some(*channel_id), None)]
        }
        ChangeFilter::MessageReactions { message_ids } => message_ids
            .iter()
            .map(|id| event(ChangeTable::MessageReactions, None, Some(*id)))
            .collect(),
        ChangeFilter::ThreadReplies { parent_id } => {
            vec![event(ChangeTable::Messages, None, Some(*parent_id))]
        }
        ChangeFilter::ChannelMembers { channel_id } => {
            vec![event(ChangeTable::ChannelMembers, Some(*channel_id), None)]
        }
        ChangeFilter::Users => vec![event(ChangeTable::Users, None, None)],
    }
}

fn resync_routes(routes: &mut Routes) {
    routes.retain(|subscription_id, (filter, events)| {
        let open = resync_events(filter)
            .into_iter()
            .all(|event| events.send(event).is_ok());
        if !open {
            debug!(subscription_id, "dropping closed route on resync");
        }
        open
    });
}

async fn run_socket(
    url: Url,
    first: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let mut routes = Routes::new();
    let mut socket = Some(first);
    let mut backoff = INITIAL_BACKOFF;

    'connection: loop {
        let (ws, reconnected) = match socket.take() {
            Some(ws) => (ws, false),
            None => match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    info!(subscriptions = routes.len(), "realtime reconnected");
                    backoff = INITIAL_BACKOFF;
                    (ws, true)
                }
                Err(err) => {
                    warn!(%err, retry_in_ms = backoff.as_millis() as u64, "realtime reconnect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            },
        };
        let (mut sink, mut source) = ws.split();

        for (subscription_id, (filter, _)) in &routes {
            let command = RealtimeCommand::Subscribe {
                subscription_id: *subscription_id,
                filter: filter.clone(),
            };
            if !send_command(&mut sink, &command).await {
                continue 'connection;
            }
        }
        if reconnected {
            resync_routes(&mut routes);
        }

        loop {
            tokio::select! {
                control = control_rx.recv() => {
                    let command = match control {
                        None => {
                            let _ = sink.close().await;
                            return;
                        }
                        Some(Control::Subscribe { subscription_id, filter, events }) => {
                            routes.insert(subscription_id, (filter.clone(), events));
                            RealtimeCommand::Subscribe { subscription_id, filter }
                        }
                        Some(Control::Unsubscribe { subscription_id }) => {
                            routes.remove(&subscription_id);
                            RealtimeCommand::Unsubscribe { subscription_id }
                        }
                    };
                    if !send_command(&mut sink, &command).await {
                        break;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => route_frame(&text, &mut routes),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "realtime read failed");
                        break;
                    }
                },
            }
        }

        warn!("realtime connection lost");
        tokio::time::sleep(backoff).await;
    }
}
