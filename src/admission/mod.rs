//! Admission policies: scope resolution, rate limiting and connection limiting.

mod connection;
mod policies;
mod rate;
mod rules;
mod scope;

use std::sync::Arc;

use crate::pipeline::RequestContext;

pub use connection::{ConnectionLimiter, ConnectionRecord, ConnectionRejection, ConnectionSlot};
pub use policies::{CustomResolvers, LimitCallbacks, PolicySet};
pub use rate::{BypassReason, RateDecision, RateLimiter, RateRecord};
pub use rules::{ConnectionLimitRule, RateLimitRule, ScopeKind};
pub use scope::{
    Scope, ScopeFn, ScopeResolver, TrustedProxies, DEFAULT_CUSTOM_KEY, FORWARDED_FOR,
    GLOBAL_SCOPE_KEY,
};

/// Produces the reply for a rejected request in place of the default one.
pub type LimitCallback = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;
