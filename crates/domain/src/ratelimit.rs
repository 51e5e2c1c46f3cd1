//! Fixed-window rate limiting per (endpoint, hashed identity).
//!
//! The counter store is an external shared resource (multiple stateless
//! replicas increment it); failure of that store fails open so an infra
//! outage never becomes a denial of service against legitimate users.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::hash_identity;
use crate::storage::CounterStore;

/// Window state exposed alongside every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(RateLimitStatus),
    Limited(RateLimitStatus),
}

impl RateDecision {
    pub fn status(&self) -> RateLimitStatus {
        match self {
            Self::Allowed(status) | Self::Limited(status) => *status,
        }
    }

    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited(_))
    }
}

pub struct RateLimiter<S> {
    store: Arc<S>,
    limit: u32,
    window: Duration,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            limit: self.limit,
            window: self.window,
        }
    }
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn new(store: Arc<S>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit: limit.max(1),
            window,
        }
    }

    /// Counts one request for `identity` against `endpoint`'s window. The
    /// identity is hashed before it becomes part of the counter key; the
    /// clear value never reaches the store or the logs.
    pub async fn check(&self, endpoint: &str, identity: &str, now: DateTime<Utc>) -> RateDecision {
        let key = format!("{}:{}", endpoint, hash_identity(identity));

        let window_count = match self.store.increment(&key, self.window, now).await {
            Ok(count) => count,
            Err(err) => {
                counter!("rate_limit_checks_total", 1, "result" => "store_error");
                warn!(endpoint, ?err, "counter store failed, failing open");
                return RateDecision::Allowed(RateLimitStatus {
                    limit: self.limit,
                    remaining: self.limit,
                    reset_seconds: self.window.num_seconds(),
                });
            }
        };

        let used = u32::try_from(window_count.count.max(0)).unwrap_or(u32::MAX);
        let status = RateLimitStatus {
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            reset_seconds: (window_count.window_expires_at - now).num_seconds().max(0),
        };

        if used > self.limit {
            counter!("rate_limit_checks_total", 1, "result" => "limited");
            RateDecision::Limited(status)
        } else {
            counter!("rate_limit_checks_total", 1, "result" => "allowed");
            RateDecision::Allowed(status)
        }
    }
}
