use std::{sync::Arc, time::Duration};

use config::RateLimitConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{RateLimitError, TokenBucket};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Allowed,
    /// The bucket is empty.
    Denied {
        /// Time until the next token is available.
        retry_after: Duration,
    },
}

impl Admission {
    /// Converts a denial into an error naming the credential.
    pub fn into_result(self, credential: &str) -> Result<(), RateLimitError> {
        match self {
            Admission::Allowed => Ok(()),
            Admission::Denied { retry_after } => Err(RateLimitError::CredentialLimitExceeded {
                credential: credential.to_string(),
                retry_after,
            }),
        }
    }
}

/// Token-bucket admission control keyed by credential id.
///
/// The map only guards bucket creation. Each bucket has its own lock, held for the refill
/// arithmetic and nothing else, so credentials never contend on each other's state.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    /// Creates an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and consumes one token for the credential.
    pub fn try_acquire(&self, credential_id: &str, limit: Option<&RateLimitConfig>) -> Admission {
        self.try_acquire_at(credential_id, limit, Instant::now())
    }

    /// Like [`RateLimiter::try_acquire`] with an explicit clock reading.
    pub fn try_acquire_at(&self, credential_id: &str, limit: Option<&RateLimitConfig>, now: Instant) -> Admission {
        let Some(limit) = limit else {
            return Admission::Allowed;
        };

        let capacity = limit.capacity();
        let refill_rate = limit.requests_per_second;

        let bucket = match self.buckets.get(credential_id) {
            Some(bucket) => bucket.clone(),
            None => self
                .buckets
                .entry(credential_id.to_string())
                .or_insert_with(|| {
                    log::debug!("Creating rate limit bucket for credential '{credential_id}': {refill_rate}/s, burst {capacity}");
                    Arc::new(Mutex::new(TokenBucket::new(capacity, refill_rate, now)))
                })
                .clone(),
        };

        let mut bucket = bucket.lock();

        if !bucket.matches(capacity, refill_rate) {
            log::debug!("Rate limit for credential '{credential_id}' changed to {refill_rate}/s, burst {capacity}");
            bucket.reconfigure(capacity, refill_rate);
        }

        match bucket.try_take(now) {
            Ok(()) => Admission::Allowed,
            Err(retry_after) => {
                log::debug!("Rate limit exceeded for credential '{credential_id}', retry after {retry_after:?}");
                Admission::Denied { retry_after }
            }
        }
    }

    /// Drops buckets of credentials no longer present, e.g. after a configuration reload.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.buckets.retain(|id, _| keep(id));
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket has been created yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
