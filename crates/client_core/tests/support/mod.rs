//! In-process server for client tests: a `ChatBackend` that calls the API
//! layer directly and a `RealtimeSource` fed by its change feed.

#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use client_core::{ChangeStream, ChatBackend, ChatClient, ClientResult, RealtimeSource};
use server_api::{channels, messages, reactions, users, ApiContext, ChangeFeed};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ChangeFilter, ChannelSummary, CreateChannelRequest, ListMessagesQuery, MembershipPayload,
        MessagePayload, PostMessageRequest, ReactionPayload, ReactionsByEmoji,
        UpdateProfileRequest, UserProfile,
    },
};
use storage::Storage;
use tokio::sync::{broadcast::error::RecvError, mpsc};

pub struct InProcessBackend {
    ctx: ApiContext,
    user_id: UserId,
    fail_posts: AtomicBool,
    fail_reactions: AtomicBool,
    post_delay_ms: AtomicU64,
    reaction_delay_ms: AtomicU64,
    post_response_delay_ms: AtomicU64,
    list_response_delay_ms: AtomicU64,
}

impl InProcessBackend {
    pub fn new(ctx: ApiContext, user_id: UserId) -> Self {
        Self {
            ctx,
            user_id,
            fail_posts: AtomicBool::new(false),
            fail_reactions: AtomicBool::new(false),
            post_delay_ms: AtomicU64::new(0),
            reaction_delay_ms: AtomicU64::new(0),
            post_response_delay_ms: AtomicU64::new(0),
            list_response_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reactions(&self, fail: bool) {
        self.fail_reactions.store(fail, Ordering::SeqCst);
    }

    pub fn delay_posts(&self, delay: Duration) {
        self.post_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_reactions(&self, delay: Duration) {
        self.reaction_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Posts are stored at once; only the reply is held back.
    pub fn delay_post_responses(&self, delay: Duration) {
        self.post_response_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Pages are read at once; only the reply is held back.
    pub fn delay_list_responses(&self, delay: Duration) {
        self.list_response_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl ChatBackend for InProcessBackend {
    async fn current_user(&self) -> ClientResult<UserProfile> {
        Ok(users::get_profile(&self.ctx, self.user_id).await?)
    }

    async fn update_profile(&self, req: UpdateProfileRequest) -> ClientResult<UserProfile> {
        Ok(users::update_profile(&self.ctx, self.user_id, req).await?)
    }

    async fn list_channels(&self) -> ClientResult<Vec<ChannelSummary>> {
        Ok(channels::list_channels(&self.ctx, self.user_id).await?)
    }

    async fn create_channel(&self, req: CreateChannelRequest) -> ClientResult<ChannelSummary> {
        Ok(channels::create_channel(&self.ctx, self.user_id, req).await?)
    }

    async fn join_channel(&self, channel_id: ChannelId) -> ClientResult<MembershipPayload> {
        Ok(channels::join_channel(&self.ctx, self.user_id, channel_id).await?)
    }

    async fn list_messages(
        &self,
        channel_id: ChannelId,
        query: &ListMessagesQuery,
    ) -> ClientResult<Vec<MessagePayload>> {
        let page = messages::list_messages(&self.ctx, self.user_id, channel_id, query).await?;
        Self::pause(&self.list_response_delay_ms).await;
        Ok(page)
    }

    async fn post_message(
        &self,
        channel_id: ChannelId,
        req: PostMessageRequest,
    ) -> ClientResult<MessagePayload> {
        Self::pause(&self.post_delay_ms).await;
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(ApiError::upstream().into());
        }
        let message = messages::post_message(&self.ctx, self.user_id, channel_id, req).await?;
        Self::pause(&self.post_response_delay_ms).await;
        Ok(message)
    }

    async fn update_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> ClientResult<MessagePayload> {
        Ok(
            messages::update_message(&self.ctx, self.user_id, channel_id, message_id, content)
                .await?,
        )
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> ClientResult<()> {
        Ok(messages::delete_message(&self.ctx, self.user_id, channel_id, message_id).await?)
    }

    async fn list_replies(
        &self,
        channel_id: ChannelId,
        parent_id: MessageId,
    ) -> ClientResult<Vec<MessagePayload>> {
        Ok(messages::list_replies(&self.ctx, self.user_id, channel_id, parent_id).await?)
    }

    async fn toggle_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> ClientResult<ReactionsByEmoji> {
        Self::pause(&self.reaction_delay_ms).await;
        if self.fail_reactions.load(Ordering::SeqCst) {
            return Err(ApiError::upstream().into());
        }
        Ok(
            reactions::toggle_reaction(&self.ctx, self.user_id, channel_id, message_id, emoji)
                .await?,
        )
    }

    async fn list_reactions(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> ClientResult<Vec<ReactionPayload>> {
        Ok(reactions::list_reactions(&self.ctx, self.user_id, channel_id, message_id).await?)
    }
}

/// Subscriptions filtered straight off the in-process change feed.
pub struct FeedRealtime {
    feed: ChangeFeed,
    next_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl FeedRealtime {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            feed,
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeSource for FeedRealtime {
    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeStream> {
        let subscription_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) if filter.matches(&event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        Ok(ChangeStream::new(subscription_id, rx, move || {
            task.abort();
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

pub struct TestUser {
    pub client: ChatClient,
    pub backend: Arc<InProcessBackend>,
    pub realtime: Arc<FeedRealtime>,
}

pub async fn api() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext::new(storage)
}

pub async fn sign_in(ctx: &ApiContext, email: &str, name: &str) -> TestUser {
    let profile = users::sync_user(ctx, email, name).await.expect("sync user");
    let backend = Arc::new(InProcessBackend::new(ctx.clone(), profile.id));
    let realtime = Arc::new(FeedRealtime::new(ctx.feed.clone()));
    let client = ChatClient::new(backend.clone(), realtime.clone(), profile);
    TestUser {
        client,
        backend,
        realtime,
    }
}

pub async fn general(user: &TestUser) -> ChannelId {
    user.client
        .backend()
        .list_channels()
        .await
        .expect("channels")
        .into_iter()
        .find(|c| c.name == "general")
        .map(|c| c.id)
        .expect("general exists")
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
