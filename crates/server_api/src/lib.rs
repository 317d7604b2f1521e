use std::sync::Arc;

use shared::error::ApiError;
use storage::Storage;
use tracing::error;

pub mod access;
pub mod channels;
pub mod feed;
pub mod messages;
pub mod rate_limit;
pub mod reactions;
pub mod users;

pub use feed::ChangeFeed;
pub use rate_limit::{CounterStore, InMemoryCounterStore, RateLimitAction, RateLimiter};

pub const DEFAULT_REACTION_CAP: i64 = 10;
pub const DEFAULT_CHANNEL_CAP: i64 = 10;

/// Per-user quotas enforced by the write paths.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub reaction_cap: i64,
    pub channel_cap: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            reaction_cap: DEFAULT_REACTION_CAP,
            channel_cap: DEFAULT_CHANNEL_CAP,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub feed: ChangeFeed,
    pub limits: Limits,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ApiContext {
    /// Context with default limits and an unlimited in-memory rate limiter.
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            feed: ChangeFeed::default(),
            limits: Limits::default(),
            rate_limiter: Arc::new(RateLimiter::disabled()),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }
}

/// Storage and provider failures stop here: the detail goes to the log and
/// the caller gets a generic upstream failure.
pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "storage operation failed");
    ApiError::upstream()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
