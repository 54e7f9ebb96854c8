//! In-flight connection limiting with guaranteed release.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::{debug, trace, warn};

use super::scope::ScopeResolver;
use super::LimitCallback;
use crate::error::{HandlerResult, Result, TurnstileError};
use crate::pipeline::{Middleware, Next, Reply, RequestContext};
use crate::store::{CasOutcome, ScopeKey, SharedCounterStore};

/// In-flight request count for one key.
///
/// Exists only while the count is above zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub in_flight: u32,
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRejection {
    /// The aggregate cap across all keys is reached.
    GlobalLimit,
    /// The key already holds its maximum number of slots.
    PerKeyLimit,
}

impl fmt::Display for ConnectionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRejection::GlobalLimit => f.write_str("global connection limit reached"),
            ConnectionRejection::PerKeyLimit => f.write_str("per-key connection limit reached"),
        }
    }
}

/// A held connection slot.
///
/// Dropping the slot releases it, whether the request completed, failed,
/// panicked, or its future was dropped mid-flight. A slot whose future
/// never completes is never released.
#[must_use = "dropping the slot releases it immediately"]
#[derive(Debug)]
pub struct ConnectionSlot {
    store: Arc<SharedCounterStore<ConnectionRecord>>,
    key: Option<ScopeKey>,
}

impl ConnectionSlot {
    /// The key this slot is counted against, if the store had room for it.
    pub fn key(&self) -> Option<&ScopeKey> {
        self.key.as_ref()
    }

    pub fn is_tracked(&self) -> bool {
        self.key.is_some()
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release_key(&self.store, key.as_str());
            trace!(key = %key, "Connection slot released");
        }
        self.store.decrement_total();
    }
}

/// Decrement the count for `key`, deleting the record when it reaches zero.
///
/// Other requests sharing the key may be mutating the record concurrently,
/// so each step is a conditional write retried until it lands.
fn release_key(store: &SharedCounterStore<ConnectionRecord>, key: &str) {
    loop {
        match store.get(key) {
            None => {
                warn!(key = %key, "Connection record missing on release");
                return;
            }
            Some(record) if record.in_flight <= 1 => {
                if store.compare_and_delete(key, record) {
                    return;
                }
            }
            Some(record) => {
                let next = ConnectionRecord {
                    in_flight: record.in_flight - 1,
                };
                if store.compare_and_set(key, Some(record), next) == CasOutcome::Applied {
                    return;
                }
            }
        }
    }
}

/// Limits concurrent in-flight requests per key and in aggregate.
pub struct ConnectionLimiter {
    name: String,
    resolver: ScopeResolver,
    max_per_key: u32,
    global_max: u32,
    store: Arc<SharedCounterStore<ConnectionRecord>>,
    on_limit_exceeded: Option<LimitCallback>,
}

impl ConnectionLimiter {
    /// Create a limiter tracking at most `capacity` keys.
    ///
    /// `global_max` of `None` leaves the aggregate unbounded.
    pub fn new(
        name: impl Into<String>,
        resolver: ScopeResolver,
        max_per_key: u32,
        global_max: Option<u32>,
        capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        if max_per_key == 0 {
            return Err(TurnstileError::Config(format!(
                "connection limit '{}': max_connections must be greater than zero",
                name
            )));
        }
        if capacity == 0 {
            return Err(TurnstileError::Config(format!(
                "connection limit '{}': capacity must be greater than zero",
                name
            )));
        }
        if let Some(global_max) = global_max {
            if global_max < max_per_key {
                return Err(TurnstileError::Config(format!(
                    "connection limit '{}': global_max ({}) is below max_connections ({})",
                    name, global_max, max_per_key
                )));
            }
        }

        Ok(Self {
            name,
            resolver,
            max_per_key,
            global_max: global_max.unwrap_or(u32::MAX),
            store: Arc::new(SharedCounterStore::new(capacity)),
            on_limit_exceeded: None,
        })
    }

    /// Replace the default rejection reply with a callback.
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

    /// Claim a slot for `key`.
    pub fn acquire(&self, key: &str) -> std::result::Result<ConnectionSlot, ConnectionRejection> {
        // Claim the aggregate unit first; roll it back on a per-key refusal.
        if self.store.try_increment_total(self.global_max).is_none() {
            return Err(ConnectionRejection::GlobalLimit);
        }

        loop {
            let current = self.store.get(key);
            let in_flight = current.map_or(0, |record| record.in_flight);
            if in_flight >= self.max_per_key {
                self.store.decrement_total();
                return Err(ConnectionRejection::PerKeyLimit);
            }

            let next = ConnectionRecord {
                in_flight: in_flight + 1,
            };
            match self.store.compare_and_set(key, current, next) {
                CasOutcome::Applied => {
                    return Ok(ConnectionSlot {
                        store: Arc::clone(&self.store),
                        key: Some(ScopeKey::from(key)),
                    })
                }
                CasOutcome::Conflict => continue,
                CasOutcome::Full => {
                    warn!(
                        policy = %self.name,
                        key = %key,
                        capacity = self.store.capacity(),
                        "Connection store full; key not enforced"
                    );
                    return Ok(ConnectionSlot {
                        store: Arc::clone(&self.store),
                        key: None,
                    });
                }
            }
        }
    }

    /// Slots currently held for `key`.
    pub fn in_flight(&self, key: &str) -> u32 {
        self.store.get(key).map_or(0, |record| record.in_flight)
    }

    /// Slots currently held across all keys.
    pub fn total(&self) -> u32 {
        self.store.total()
    }

    /// Number of keys holding at least one slot.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn reject(&self, ctx: &mut RequestContext, rejection: ConnectionRejection) {
        if let Some(callback) = &self.on_limit_exceeded {
            callback(ctx);
            return;
        }

        let status = match rejection {
            ConnectionRejection::GlobalLimit => StatusCode::SERVICE_UNAVAILABLE,
            ConnectionRejection::PerKeyLimit => StatusCode::TOO_MANY_REQUESTS,
        };
        ctx.respond_with(Reply::json(
            status,
            &serde_json::json!({ "error": rejection.to_string() }),
        ));
    }
}

impl fmt::Debug for ConnectionLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLimiter")
            .field("name", &self.name)
            .field("scope", self.resolver.scope())
            .field("max_per_key", &self.max_per_key)
            .field("global_max", &self.global_max)
            .field("total", &self.store.total())
            .finish()
    }
}

#[async_trait]
impl Middleware for ConnectionLimiter {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        let key = self.resolver.resolve(ctx);

        match self.acquire(key.as_str()) {
            Ok(slot) => {
                let result = next.run(ctx).await;
                drop(slot);
                result
            }
            Err(rejection) => {
                debug!(policy = %self.name, key = %key, %rejection, "Connection rejected");
                self.reject(ctx, rejection);
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
