use std::sync::Arc;

use shared::{
    domain::{ChannelId, MessageId},
    protocol::UserProfile,
};
use tracing::info;

pub mod backend;
pub mod error;
mod listener;
pub mod pagination;
pub mod realtime;
pub mod reconcile;
pub mod scroll;
pub mod sequencer;
pub mod session;
pub mod view;

pub use backend::{ChatBackend, HttpBackend};
pub use error::{ClientError, ClientResult};
pub use realtime::{ChangeStream, RealtimeSource, WsRealtime};
pub use reconcile::{Reconciler, ReplaceReconciler, Snapshot};
pub use session::{ClientEvent, ConversationView, ViewScope};
pub use view::{MessageKey, MessageList, ViewMessage};

/// A signed-in user's handle on the server: opens channel and thread views
/// that share one backend and one realtime connection.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    realtime: Arc<dyn RealtimeSource>,
    reconciler: Arc<dyn Reconciler>,
    me: UserProfile,
}

impl ChatClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        realtime: Arc<dyn RealtimeSource>,
        me: UserProfile,
    ) -> Self {
        Self {
            backend,
            realtime,
            reconciler: Arc::new(ReplaceReconciler),
            me,
        }
    }

    /// Signs in over HTTP and opens the realtime socket for the session.
    pub async fn connect(server_url: &str, email: &str, name: &str) -> ClientResult<Self> {
        let (backend, session) = HttpBackend::sign_in(server_url, email, name).await?;
        let realtime = WsRealtime::connect(server_url, backend.token()).await?;
        info!(user_id = session.user.id.0, "client connected");
        Ok(Self::new(Arc::new(backend), Arc::new(realtime), session.user))
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn me(&self) -> &UserProfile {
        &self.me
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Re-reads the signed-in profile, e.g. after a status change.
    pub async fn refresh_me(&mut self) -> ClientResult<&UserProfile> {
        self.me = self.backend.current_user().await?;
        Ok(&self.me)
    }

    pub async fn open_channel(&self, channel_id: ChannelId) -> ClientResult<ConversationView> {
        self.open(ViewScope::Channel(channel_id)).await
    }

    pub async fn open_thread(
        &self,
        channel_id: ChannelId,
        parent_id: MessageId,
    ) -> ClientResult<ConversationView> {
        self.open(ViewScope::Thread {
            channel_id,
            parent_id,
        })
        .await
    }

    async fn open(&self, scope: ViewScope) -> ClientResult<ConversationView> {
        ConversationView::open(
            self.backend.clone(),
            self.realtime.clone(),
            self.reconciler.clone(),
            self.me.summary(),
            scope,
        )
        .await
    }
}
