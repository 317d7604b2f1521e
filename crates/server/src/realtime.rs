//! `/realtime` websocket: clients register filtered subscriptions and receive
//! the matching change events.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use server_api::access;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{ChangeEvent, ChangeFilter, RealtimeCommand, RealtimeFrame},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{error::HttpError, AppState};

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<RealtimeQuery>,
) -> Response {
    match state.sessions.verify(&q.token) {
        Ok(user_id) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, user_id))
            .into_response(),
        Err(err) => HttpError(err).into_response(),
    }
}

/// Active subscriptions of one connection.
#[derive(Debug, Default)]
pub struct Subscriptions {
    filters: HashMap<u64, ChangeFilter>,
}

impl Subscriptions {
    pub fn insert(&mut self, subscription_id: u64, filter: ChangeFilter) {
        self.filters.insert(subscription_id, filter);
    }

    pub fn remove(&mut self, subscription_id: u64) -> bool {
        self.filters.remove(&subscription_id).is_some()
    }

    /// Ids of the subscriptions `event` should be delivered to, ascending.
    pub fn matching(&self, event: &ChangeEvent) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .filters
            .iter()
            .filter(|(_, filter)| filter.matches(event))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// A subscriber only sees changes in channels they belong to.
async fn authorize(
    state: &AppState,
    user_id: UserId,
    filter: &ChangeFilter,
) -> Result<(), ApiError> {
    match filter {
        ChangeFilter::ChannelMessages { channel_id } | ChangeFilter::ChannelMembers { channel_id } => {
            access::require_member(&state.api, *channel_id, user_id).await?;
        }
        ChangeFilter::ThreadReplies { parent_id } => {
            require_message_access(state, user_id, *parent_id).await?;
        }
        ChangeFilter::MessageReactions { message_ids } => {
            for message_id in message_ids {
                require_message_access(state, user_id, *message_id).await?;
            }
        }
        ChangeFilter::Users => {
            access::current_user(&state.api, user_id).await?;
        }
    }
    Ok(())
}

async fn require_message_access(
    state: &AppState,
    user_id: UserId,
    message_id: shared::domain::MessageId,
) -> Result<(), ApiError> {
    let message = state
        .api
        .storage
        .message_by_id(message_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "message lookup failed");
            ApiError::upstream()
        })?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    access::require_member(&state.api, message.channel_id, user_id).await?;
    Ok(())
}

async fn send_frame<S>(sender: &mut S, frame: &RealtimeFrame) -> bool
where
    S: Sink<Message> + Unpin,
{
    let Ok(text) = serde_json::to_string(frame) else {
        return true;
    };
    sender.send(Message::Text(text)).await.is_ok()
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.api.feed.subscribe();
    let mut subscriptions = Subscriptions::default();
    info!(user_id = user_id.0, "realtime connection opened");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(message)) = incoming else { break };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let reply = match serde_json::from_str::<RealtimeCommand>(&text) {
                    Ok(RealtimeCommand::Subscribe { subscription_id, filter }) => {
                        match authorize(&state, user_id, &filter).await {
                            Ok(()) => {
                                debug!(user_id = user_id.0, subscription_id, ?filter, "subscribed");
                                subscriptions.insert(subscription_id, filter);
                                RealtimeFrame::Subscribed { subscription_id }
                            }
                            Err(err) => {
                                warn!(user_id = user_id.0, subscription_id, code = ?err.code, "subscription refused");
                                RealtimeFrame::Error(err)
                            }
                        }
                    }
                    Ok(RealtimeCommand::Unsubscribe { subscription_id }) => {
                        subscriptions.remove(subscription_id);
                        continue;
                    }
                    Err(err) => {
                        warn!(user_id = user_id.0, %err, "malformed realtime command");
                        RealtimeFrame::Error(ApiError::invalid_input("malformed realtime command"))
                    }
                };
                if !send_frame(&mut sender, &reply).await {
                    break;
                }
            }
            event = events_rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id = user_id.0, skipped, "realtime subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                for subscription_id in subscriptions.matching(&event) {
                    let frame = RealtimeFrame::Change { subscription_id, event: event.clone() };
                    if !send_frame(&mut sender, &frame).await {
                        info!(user_id = user_id.0, "realtime connection closed");
                        return;
                    }
                }
            }
        }
    }
    info!(user_id = user_id.0, "realtime connection closed");
}
