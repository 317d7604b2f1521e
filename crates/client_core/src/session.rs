//! An open channel or thread: optimistic sends and reaction toggles,
//! history paging, and re-fetch on change.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use shared::{
    cursor::MessageCursor,
    domain::{ChannelId, MessageId},
    error::ApiError,
    protocol::{
        AttachmentPayload, ChangeFilter, MessagePayload, PostMessageRequest, ReactionsByEmoji,
        UserSummary,
    },
    reactions::{group_reactions, toggle_grouped},
    validate,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::ChatBackend,
    error::ClientResult,
    listener::{spawn_message_listener, spawn_reaction_listener},
    pagination::{PaginationCursor, REFETCH_PAGE_SIZE},
    realtime::RealtimeSource,
    reconcile::{Reconciler, Snapshot},
    scroll::{restore_position, ScrollMetrics},
    sequencer::{KeyedLocks, RequestSequencer, Resource, Ticket},
    view::{MessageKey, MessageList, ViewMessage},
};

pub const SEND_FAILED_TOAST: &str = "Failed to send message";
pub const REACTION_FAILED_TOAST: &str = "Failed to update reaction. Please try again.";
/// Name shown for the local user in optimistic reaction groups.
pub const OPTIMISTIC_REACTOR_NAME: &str = "You";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessagesChanged,
    ReactionsChanged { message_id: MessageId },
    /// Short user-facing notice.
    Toast(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewScope {
    Channel(ChannelId),
    Thread {
        channel_id: ChannelId,
        parent_id: MessageId,
    },
}

impl ViewScope {
    pub fn channel_id(&self) -> ChannelId {
        match *self {
            ViewScope::Channel(channel_id) | ViewScope::Thread { channel_id, .. } => channel_id,
        }
    }

    pub fn parent_id(&self) -> Option<MessageId> {
        match *self {
            ViewScope::Channel(_) => None,
            ViewScope::Thread { parent_id, .. } => Some(parent_id),
        }
    }

    fn resource(&self) -> Resource {
        match *self {
            ViewScope::Channel(channel_id) => Resource::ChannelMessages(channel_id),
            ViewScope::Thread { parent_id, .. } => Resource::ThreadReplies(parent_id),
        }
    }

    fn filter(&self) -> ChangeFilter {
        match *self {
            ViewScope::Channel(channel_id) => ChangeFilter::ChannelMessages { channel_id },
            ViewScope::Thread { parent_id, .. } => ChangeFilter::ThreadReplies { parent_id },
        }
    }
}

#[derive(Debug, Default)]
struct ViewState {
    messages: MessageList,
    pagination: PaginationCursor,
}

impl ViewState {
    /// Reconciles a snapshot without letting it overwrite the reactions of
    /// `held` messages, whose pending toggles are about to settle them.
    fn reconcile(&mut self, reconciler: &dyn Reconciler, snapshot: Snapshot, held: &[MessageId]) {
        let held: Vec<(MessageId, ReactionsByEmoji)> = held
            .iter()
            .filter_map(|id| self.messages.reactions_of(*id).map(|r| (*id, r.clone())))
            .collect();
        reconciler.reconcile(&mut self.messages, snapshot);
        for (id, reactions) in held {
            self.messages.set_reactions(id, reactions);
        }
    }
}

/// Messages with a reaction toggle awaiting its response, and how many.
#[derive(Debug, Default)]
struct TogglesInFlight {
    counts: StdMutex<HashMap<MessageId, usize>>,
}

impl TogglesInFlight {
    fn counts(&self) -> MutexGuard<'_, HashMap<MessageId, usize>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, message_id: MessageId) -> ToggleInFlight<'_> {
        *self.counts().entry(message_id).or_default() += 1;
        ToggleInFlight {
            toggles: self,
            message_id,
        }
    }

    fn held(&self) -> Vec<MessageId> {
        self.counts().keys().copied().collect()
    }
}

/// Counts one toggle until dropped, so an abandoned toggle stops holding
/// its message's reactions.
struct ToggleInFlight<'a> {
    toggles: &'a TogglesInFlight,
    message_id: MessageId,
}

impl Drop for ToggleInFlight<'_> {
    fn drop(&mut self) {
        let mut counts = self.toggles.counts();
        if let Some(count) = counts.get_mut(&self.message_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.message_id);
            }
        }
    }
}

#[derive(Default)]
struct Listeners {
    closed: bool,
    messages: Option<JoinHandle<()>>,
    reactions: Option<(Vec<MessageId>, JoinHandle<()>)>,
    resync: Option<JoinHandle<()>>,
}

impl Listeners {
    fn abort_all(&mut self) {
        self.closed = true;
        if let Some(handle) = self.messages.take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.reactions.take() {
            handle.abort();
        }
        if let Some(handle) = self.resync.take() {
            handle.abort();
        }
    }
}

pub(crate) struct ViewInner {
    scope: ViewScope,
    me: UserSummary,
    backend: Arc<dyn ChatBackend>,
    realtime: Arc<dyn RealtimeSource>,
    reconciler: Arc<dyn Reconciler>,
    state: Mutex<ViewState>,
    sequencer: RequestSequencer,
    reaction_locks: KeyedLocks<(MessageId, String)>,
    toggles: TogglesInFlight,
    events: broadcast::Sender<ClientEvent>,
    listeners: StdMutex<Listeners>,
}

impl ViewInner {
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A local write landed. Re-reads started before it are stale, so they
    /// are dropped and a fresh one runs in the background.
    fn resync_after_write(self: &Arc<Self>) {
        let ticket = self.sequencer.issue(self.scope.resource());
        let view = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let Some(view) = view.upgrade() else { return };
            if let Err(err) = view.refetch_with(ticket).await {
                warn!(error = %err, "refetch after write failed");
                view.emit(ClientEvent::Error(err.to_string()));
            }
        });
        let mut listeners = self.listeners();
        if listeners.closed {
            handle.abort();
            return;
        }
        if let Some(previous) = listeners.resync.replace(handle) {
            previous.abort();
        }
    }

    fn optimistic_actor(&self) -> UserSummary {
        UserSummary {
            id: self.me.id,
            name: OPTIMISTIC_REACTOR_NAME.to_string(),
            avatar_ref: self.me.avatar_ref.clone(),
        }
    }

    /// Every loaded channel message from `from` onwards, newer pages until a
    /// short one comes back.
    async fn fetch_window(
        &self,
        channel_id: ChannelId,
        from: MessageCursor,
    ) -> ClientResult<Vec<MessagePayload>> {
        let mut cursor = from;
        let mut all = Vec::new();
        loop {
            let query = PaginationCursor::refetch_query(Some(cursor));
            let page = self.backend.list_messages(channel_id, &query).await?;
            let short = (page.len() as u32) < REFETCH_PAGE_SIZE;
            if let Some(last) = page.last() {
                cursor = last.cursor();
            }
            all.extend(page);
            if short {
                return Ok(all);
            }
        }
    }

    /// Re-reads the view and hands the result to the reconciler, unless a
    /// newer re-read was started in the meantime.
    pub(crate) async fn refetch_messages(self: &Arc<Self>) -> ClientResult<()> {
        let ticket = self.sequencer.issue(self.scope.resource());
        self.refetch_with(ticket).await
    }

    async fn refetch_with(self: &Arc<Self>, ticket: Ticket) -> ClientResult<()> {
        let (snapshot, fresh_page) = match self.scope {
            ViewScope::Channel(channel_id) => {
                let (from, initial) = {
                    let state = self.state.lock().await;
                    (
                        state.messages.oldest_cursor().map(MessageCursor::preceding),
                        state.pagination.initial_query(),
                    )
                };
                match from {
                    Some(from) => {
                        let messages = self.fetch_window(channel_id, from).await?;
                        (
                            Snapshot {
                                messages,
                                from: Some(from),
                            },
                            false,
                        )
                    }
                    None => {
                        let page = self.backend.list_messages(channel_id, &initial).await?;
                        (Snapshot::full(page), true)
                    }
                }
            }
            ViewScope::Thread {
                channel_id,
                parent_id,
            } => {
                let replies = self.backend.list_replies(channel_id, parent_id).await?;
                (Snapshot::full(replies), false)
            }
        };

        {
            let mut state = self.state.lock().await;
            if !self.sequencer.is_current(&ticket) {
                debug!(resource = ?ticket.resource(), "superseded refetch dropped");
                return Ok(());
            }
            if fresh_page {
                state.pagination = PaginationCursor::default();
                state.pagination.record_page(&snapshot.messages);
            }
            state.reconcile(self.reconciler.as_ref(), snapshot, &self.toggles.held());
        }
        self.emit(ClientEvent::MessagesChanged);
        self.sync_reaction_listener().await;
        Ok(())
    }

    pub(crate) async fn refetch_reactions(&self, message_id: MessageId) -> ClientResult<()> {
        let ticket = self.sequencer.issue(Resource::Reactions(message_id));
        let rows = self
            .backend
            .list_reactions(self.scope.channel_id(), message_id)
            .await?;
        let grouped = group_reactions(rows.into_iter().map(|row| (row.emoji, row.user)));
        self.apply_reactions(&ticket, message_id, grouped).await;
        Ok(())
    }

    async fn apply_reactions(
        &self,
        ticket: &Ticket,
        message_id: MessageId,
        grouped: ReactionsByEmoji,
    ) -> bool {
        let applied = {
            let mut state = self.state.lock().await;
            self.sequencer.is_current(ticket) && state.messages.set_reactions(message_id, grouped)
        };
        if applied {
            self.emit(ClientEvent::ReactionsChanged { message_id });
        }
        applied
    }

    /// Points the reactions subscription at the currently loaded messages.
    async fn sync_reaction_listener(self: &Arc<Self>) {
        let ids = self.state.lock().await.messages.confirmed_ids();
        {
            let mut listeners = self.listeners();
            if listeners.closed {
                return;
            }
            let unchanged = listeners
                .reactions
                .as_ref()
                .is_some_and(|(watched, _)| *watched == ids);
            if unchanged {
                return;
            }
            if ids.is_empty() {
                if let Some((_, handle)) = listeners.reactions.take() {
                    handle.abort();
                }
                return;
            }
        }

        let filter = ChangeFilter::MessageReactions {
            message_ids: ids.clone(),
        };
        let stream = match self.realtime.subscribe(filter).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "reaction subscription failed");
                return;
            }
        };
        let handle = spawn_reaction_listener(Arc::downgrade(self), stream);
        let mut listeners = self.listeners();
        if listeners.closed {
            handle.abort();
            return;
        }
        if let Some((_, previous)) = listeners.reactions.replace((ids, handle)) {
            previous.abort();
        }
    }
}

/// A live view of one channel or thread. Dropping it unsubscribes and
/// aborts in-flight re-fetches.
pub struct ConversationView {
    inner: Arc<ViewInner>,
}

impl ConversationView {
    pub async fn open(
        backend: Arc<dyn ChatBackend>,
        realtime: Arc<dyn RealtimeSource>,
        reconciler: Arc<dyn Reconciler>,
        me: UserSummary,
        scope: ViewScope,
    ) -> ClientResult<Self> {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(ViewInner {
            scope,
            me,
            backend,
            realtime,
            reconciler,
            state: Mutex::new(ViewState::default()),
            sequencer: RequestSequencer::default(),
            reaction_locks: KeyedLocks::default(),
            toggles: TogglesInFlight::default(),
            events,
            listeners: StdMutex::new(Listeners::default()),
        });

        // Subscribe before the first read so no change slips in between.
        let stream = inner.realtime.subscribe(scope.filter()).await?;
        let view = Self { inner };
        view.load_initial().await?;
        let handle = spawn_message_listener(Arc::downgrade(&view.inner), stream);
        view.inner.listeners().messages = Some(handle);
        view.inner.sync_reaction_listener().await;
        info!(?scope, "view opened");
        Ok(view)
    }

    async fn load_initial(&self) -> ClientResult<()> {
        let inner = &self.inner;
        let ticket = inner.sequencer.issue(inner.scope.resource());
        let page = match inner.scope {
            ViewScope::Channel(channel_id) => {
                let query = inner.state.lock().await.pagination.initial_query();
                inner.backend.list_messages(channel_id, &query).await?
            }
            ViewScope::Thread {
                channel_id,
                parent_id,
            } => inner.backend.list_replies(channel_id, parent_id).await?,
        };
        let mut state = inner.state.lock().await;
        if !inner.sequencer.is_current(&ticket) {
            return Ok(());
        }
        match inner.scope {
            ViewScope::Channel(_) => state.pagination.record_page(&page),
            // A thread arrives whole.
            ViewScope::Thread { .. } => state.pagination.record_page(&[]),
        }
        state.reconcile(inner.reconciler.as_ref(), Snapshot::full(page), &inner.toggles.held());
        Ok(())
    }

    pub fn scope(&self) -> ViewScope {
        self.inner.scope
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<ViewMessage> {
        self.inner.state.lock().await.messages.items().to_vec()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.state.lock().await.pagination.has_more()
    }

    /// Where to scroll after the list content changed height.
    pub async fn scroll_after_update(
        &self,
        before: ScrollMetrics,
        new_scroll_height: f64,
    ) -> Option<f64> {
        let newest_is_own = self
            .inner
            .state
            .lock()
            .await
            .messages
            .newest()
            .is_some_and(|m| m.is_from(self.inner.me.id));
        restore_position(before, new_scroll_height, newest_is_own)
    }

    pub async fn send_message(&self, content: &str) -> ClientResult<MessagePayload> {
        self.send_message_with_files(content, Vec::new()).await
    }

    /// Shows the message at once under a `temp-` key, then swaps in the
    /// server's copy or takes it back out.
    pub async fn send_message_with_files(
        &self,
        content: &str,
        files: Vec<AttachmentPayload>,
    ) -> ClientResult<MessagePayload> {
        let inner = &self.inner;
        let content = validate::message_content(content)?.to_string();
        let channel_id = inner.scope.channel_id();
        let parent_id = inner.scope.parent_id();
        let local_id = Uuid::new_v4();

        inner.state.lock().await.messages.push(ViewMessage::pending(
            local_id,
            channel_id,
            parent_id,
            inner.me.clone(),
            content.clone(),
        ));
        inner.emit(ClientEvent::MessagesChanged);

        let request = PostMessageRequest {
            content,
            parent_id,
            files,
        };
        match inner.backend.post_message(channel_id, request).await {
            Ok(message) => {
                inner
                    .state
                    .lock()
                    .await
                    .messages
                    .confirm_pending(local_id, message.clone());
                inner.emit(ClientEvent::MessagesChanged);
                inner.resync_after_write();
                inner.sync_reaction_listener().await;
                Ok(message)
            }
            Err(err) => {
                warn!(local_id = %local_id, error = %err, "send failed; rolling back");
                inner
                    .state
                    .lock()
                    .await
                    .messages
                    .remove(MessageKey::Pending(local_id));
                inner.emit(ClientEvent::MessagesChanged);
                inner.emit(ClientEvent::Toast(SEND_FAILED_TOAST.to_string()));
                Err(err)
            }
        }
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        let inner = &self.inner;
        let content = validate::message_content(content)?;
        let updated = inner
            .backend
            .update_message(inner.scope.channel_id(), message_id, content)
            .await?;
        let replaced = inner
            .state
            .lock()
            .await
            .messages
            .replace_confirmed(updated.clone());
        if replaced {
            inner.emit(ClientEvent::MessagesChanged);
        }
        inner.resync_after_write();
        Ok(updated)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> ClientResult<()> {
        let inner = &self.inner;
        inner
            .backend
            .delete_message(inner.scope.channel_id(), message_id)
            .await?;
        let removed = inner
            .state
            .lock()
            .await
            .messages
            .remove(MessageKey::Confirmed(message_id));
        if removed.is_some() {
            inner.emit(ClientEvent::MessagesChanged);
        }
        inner.resync_after_write();
        Ok(())
    }

    /// Flips the local user's `emoji` on a loaded message right away and
    /// settles it against the server. Toggles of the same emoji on the same
    /// message run one at a time.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> ClientResult<ReactionsByEmoji> {
        let inner = &self.inner;
        validate::emoji(emoji)?;
        let _serial = inner
            .reaction_locks
            .lock(&(message_id, emoji.to_string()))
            .await;
        let ticket = inner.sequencer.issue(Resource::Reactions(message_id));

        let in_flight = {
            let mut state = inner.state.lock().await;
            let current = state
                .messages
                .reactions_of(message_id)
                .ok_or_else(|| ApiError::not_found("message is not loaded"))?;
            let optimistic = toggle_grouped(current, &inner.optimistic_actor(), emoji);
            state.messages.set_reactions(message_id, optimistic);
            inner.toggles.start(message_id)
        };
        inner.emit(ClientEvent::ReactionsChanged { message_id });

        let result = inner
            .backend
            .toggle_reaction(inner.scope.channel_id(), message_id, emoji)
            .await;
        drop(in_flight);
        match result {
            Ok(grouped) => {
                inner.apply_reactions(&ticket, message_id, grouped.clone()).await;
                Ok(grouped)
            }
            Err(err) => {
                warn!(message_id = message_id.0, error = %err, "reaction toggle failed; refetching");
                if let Err(refetch_err) = inner.refetch_reactions(message_id).await {
                    warn!(message_id = message_id.0, error = %refetch_err, "reaction refetch failed");
                }
                inner.emit(ClientEvent::Toast(REACTION_FAILED_TOAST.to_string()));
                Err(err)
            }
        }
    }

    /// Loads the page before the oldest loaded message. Returns how many
    /// messages were added; zero once the start of the channel is reached.
    pub async fn load_older(&self) -> ClientResult<usize> {
        let inner = &self.inner;
        let ViewScope::Channel(channel_id) = inner.scope else {
            return Ok(0);
        };
        let Some(query) = inner.state.lock().await.pagination.older_query() else {
            return Ok(0);
        };
        let page = inner.backend.list_messages(channel_id, &query).await?;
        let added = {
            let mut state = inner.state.lock().await;
            state.pagination.record_page(&page);
            state.messages.prepend(page)
        };
        if added > 0 {
            inner.emit(ClientEvent::MessagesChanged);
            inner.sync_reaction_listener().await;
        }
        Ok(added)
    }

    /// Re-reads the view now, as a change event would.
    pub async fn refresh(&self) -> ClientResult<()> {
        self.inner.refetch_messages().await
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.inner.listeners().abort_all();
        debug!(scope = ?self.inner.scope, "view closed");
    }
}
