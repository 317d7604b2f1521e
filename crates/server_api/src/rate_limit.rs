use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{domain::UserId, error::ApiError};
use tokio::sync::Mutex;
use tracing::warn;

use crate::internal;

/// Hits recorded so far in the current window for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub hits: u64,
    pub resets_in: Duration,
}

/// Backing store for rate-limit counters. The in-memory store serves a
/// single process; a shared cache can implement this for several.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Records one hit against `key` and returns the window's running total.
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount>;
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<String, (Instant, u64)>>,
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, (started, _)| now.duration_since(*started) < window);
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        entry.1 += 1;
        Ok(WindowCount {
            hits: entry.1,
            resets_in: window.saturating_sub(now.duration_since(entry.0)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    PostMessage,
    ToggleReaction,
    CreateChannel,
    UpdateProfile,
}

impl RateLimitAction {
    fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::PostMessage => "post_message",
            RateLimitAction::ToggleReaction => "toggle_reaction",
            RateLimitAction::CreateChannel => "create_channel",
            RateLimitAction::UpdateProfile => "update_profile",
        }
    }
}

/// Fixed-window limiter keyed by user and action.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    max_actions: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, max_actions: u64, window: Duration) -> Self {
        Self {
            store,
            max_actions,
            window,
        }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::default()), 0, Duration::ZERO)
    }

    pub async fn check(&self, user_id: UserId, action: RateLimitAction) -> Result<(), ApiError> {
        if self.max_actions == 0 || self.window.is_zero() {
            return Ok(());
        }
        let key = format!("{}:{}", user_id.0, action.as_str());
        let count = self.store.hit(&key, self.window).await.map_err(internal)?;
        if count.hits > self.max_actions {
            let retry_after = count.resets_in.as_secs().max(1);
            warn!(user_id = user_id.0, action = action.as_str(), retry_after, "rate limited");
            return Err(ApiError::rate_limited(retry_after));
        }
        Ok(())
    }
}
