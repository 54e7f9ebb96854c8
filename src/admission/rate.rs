//! Fixed-window rate limiting over the shared counter store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use tracing::{debug, trace, warn};

use super::scope::ScopeResolver;
use super::LimitCallback;
use crate::error::{HandlerResult, Result, TurnstileError};
use crate::pipeline::{Middleware, Next, Reply, RequestContext};
use crate::store::{CasOutcome, Clock, SharedCounterStore, SystemClock, Timestamp};

/// Request count for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecord {
    pub request_count: u32,
    pub window_start: Timestamp,
}

/// Why a request was let through without being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// The store had no room for a new key.
    CapacityExceeded,
    /// A window reset lost the race twice in a row.
    Contention,
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Counted; `count` is the key's request count in the current window.
    Admitted { count: u32 },
    /// Admitted without enforcement.
    Bypassed(BypassReason),
    /// Over the limit until the window rolls over.
    Rejected { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, RateDecision::Rejected { .. })
    }
}

/// Fixed-window request limiter.
///
/// Each key gets `limit` requests per window. A window opens on the first
/// request after the previous one expired and lasts `window_secs`; windows
/// are not aligned to the wall clock and do not slide, so a burst at the
/// end of one window followed by a burst at the start of the next can
/// admit up to twice `limit` within a short span.
pub struct RateLimiter {
    name: String,
    resolver: ScopeResolver,
    limit: u32,
    window_secs: u32,
    store: SharedCounterStore<RateRecord>,
    clock: Arc<dyn Clock>,
    on_limit_exceeded: Option<LimitCallback>,
}

impl RateLimiter {
    /// Create a limiter tracking at most `capacity` keys.
    pub fn new(
        name: impl Into<String>,
        resolver: ScopeResolver,
        limit: u32,
        window_secs: u32,
        capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        if limit == 0 {
            return Err(TurnstileError::Config(format!(
                "rate limit '{}': limit must be greater than zero",
                name
            )));
        }
        if window_secs == 0 {
            return Err(TurnstileError::Config(format!(
                "rate limit '{}': window_seconds must be greater than zero",
                name
            )));
        }
        if capacity == 0 {
            return Err(TurnstileError::Config(format!(
                "rate limit '{}': capacity must be greater than zero",
                name
            )));
        }

        Ok(Self {
            name,
            resolver,
            limit,
            window_secs,
            store: SharedCounterStore::new(capacity),
            clock: Arc::new(SystemClock::new()),
            on_limit_exceeded: None,
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default 429 reply with a callback.
    pub fn with_limit_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut RequestContext) + Send + Sync + 'static,
    {
        self.on_limit_exceeded = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_secs(&self) -> u32 {
        self.window_secs
    }

    /// Count a request against `key` and decide whether to admit it.
    pub fn check(&self, key: &str) -> RateDecision {
        let mut reset_conflicts = 0;

        loop {
            let now = self.clock.now();
            let current = self.store.get(key);

            match current {
                Some(record) if !self.window_expired(&record, now) => {
                    if record.request_count >= self.limit {
                        return RateDecision::Rejected {
                            retry_after_secs: self.retry_after(&record, now),
                        };
                    }

                    let next = RateRecord {
                        request_count: record.request_count + 1,
                        window_start: record.window_start,
                    };
                    match self.store.compare_and_set(key, current, next) {
                        CasOutcome::Applied => {
                            return RateDecision::Admitted {
                                count: next.request_count,
                            }
                        }
                        // Another worker counted first; re-read.
                        CasOutcome::Conflict => continue,
                        CasOutcome::Full => {
                            return RateDecision::Bypassed(BypassReason::CapacityExceeded)
                        }
                    }
                }
                _ => {
                    let fresh = RateRecord {
                        request_count: 1,
                        window_start: now,
                    };
                    match self.store.compare_and_set(key, current, fresh) {
                        CasOutcome::Applied => {
                            trace!(policy = %self.name, key = %key, window_start = now, "Opened rate window");
                            return RateDecision::Admitted { count: 1 };
                        }
                        CasOutcome::Full => {
                            warn!(
                                policy = %self.name,
                                key = %key,
                                capacity = self.store.capacity(),
                                "Rate store full; key not enforced"
                            );
                            return RateDecision::Bypassed(BypassReason::CapacityExceeded);
                        }
                        CasOutcome::Conflict => {
                            reset_conflicts += 1;
                            if reset_conflicts > 1 {
                                debug!(policy = %self.name, key = %key, "Window reset contended; admitting");
                                return RateDecision::Bypassed(BypassReason::Contention);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Requests counted for `key` in its current window.
    pub fn current_count(&self, key: &str) -> u32 {
        let now = self.clock.now();
        self.store
            .get(key)
            .filter(|record| !self.window_expired(record, now))
            .map_or(0, |record| record.request_count)
    }

    /// Number of keys holding a record.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn window_expired(&self, record: &RateRecord, now: Timestamp) -> bool {
        now.saturating_sub(record.window_start) >= u64::from(self.window_secs)
    }

    fn retry_after(&self, record: &RateRecord, now: Timestamp) -> u64 {
        record
            .window_start
            .saturating_add(u64::from(self.window_secs))
            .saturating_sub(now)
            .max(1)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("scope", self.resolver.scope())
            .field("limit", &self.limit)
            .field("window_secs", &self.window_secs)
            .field("tracked_keys", &self.store.len())
            .finish()
    }
}

#[async_trait]
impl Middleware for RateLimiter {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        let key = self.resolver.resolve(ctx);

        let retry_after_secs = match self.check(key.as_str()) {
            RateDecision::Rejected { retry_after_secs } => retry_after_secs,
            decision => {
                trace!(policy = %self.name, key = %key, ?decision, "Rate check passed");
                return next.run(ctx).await;
            }
        };

        debug!(
            policy = %self.name,
            key = %key,
            limit = self.limit,
            retry_after_secs,
            "Rate limit exceeded"
        );

        match &self.on_limit_exceeded {
            Some(callback) => callback(ctx),
            None => {
                ctx.respond_with(
                    Reply::json(
                        StatusCode::TOO_MANY_REQUESTS,
                        &serde_json::json!({ "error": "rate limit exceeded" }),
                    )
                    .with_header(RETRY_AFTER, HeaderValue::from(retry_after_secs)),
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
