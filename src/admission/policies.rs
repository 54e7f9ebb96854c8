//! Construction of admission policies from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::connection::ConnectionLimiter;
use super::rate::RateLimiter;
use super::rules::ScopeKind;
use super::scope::{Scope, ScopeFn, ScopeResolver, TrustedProxies};
use super::LimitCallback;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::pipeline::PipelineBuilder;
use crate::store::Clock;

/// Named key functions available to `custom` scoped policies.
pub type CustomResolvers = HashMap<String, ScopeFn>;

/// Named rejection callbacks selectable through `on_limit_exceeded`.
pub type LimitCallbacks = HashMap<String, LimitCallback>;

/// Every admission policy of a process, created once at startup.
///
/// Each limiter owns its store; handles are shared with the pipeline and
/// with anything else that wants to inspect counters.
#[derive(Debug, Default)]
pub struct PolicySet {
    connection_limiters: Vec<Arc<ConnectionLimiter>>,
    rate_limiters: Vec<Arc<RateLimiter>>,
}

impl PolicySet {
    /// Build the policies described by `config`.
    ///
    /// Resolver and callback names used by the rules must be present in
    /// `resolvers` and `callbacks`.
    pub fn from_config(
        config: &TurnstileConfig,
        resolvers: &CustomResolvers,
        callbacks: &LimitCallbacks,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let trusted = TrustedProxies::new(config.trusted_proxies.iter().copied());

        let mut connection_limiters = Vec::with_capacity(config.connection_limits.len());
        for rule in &config.connection_limits {
            let scope = resolve_scope(&rule.name, rule.scope, rule.resolver.as_deref(), resolvers)?;
            let mut limiter = ConnectionLimiter::new(
                rule.name.clone(),
                ScopeResolver::new(scope, trusted.clone()),
                rule.max_connections,
                rule.global_max,
                rule.capacity as usize,
            )?;
            let callback =
                lookup_callback(&rule.name, rule.on_limit_exceeded.as_deref(), callbacks)?;
            if let Some(callback) = callback {
                limiter = limiter.with_limit_callback(move |ctx| callback(ctx));
            }
            info!(
                policy = %rule.name,
                scope = ?rule.scope,
                max_connections = rule.max_connections,
                global_max = ?rule.global_max,
                "Connection limiter initialized"
            );
            connection_limiters.push(Arc::new(limiter));
        }

        let mut rate_limiters = Vec::with_capacity(config.rate_limits.len());
        for rule in &config.rate_limits {
            let scope = resolve_scope(&rule.name, rule.scope, rule.resolver.as_deref(), resolvers)?;
            let mut limiter = RateLimiter::new(
                rule.name.clone(),
                ScopeResolver::new(scope, trusted.clone()),
                rule.limit,
                rule.window_seconds,
                rule.capacity as usize,
            )?
            .with_clock(Arc::clone(&clock));
            let callback =
                lookup_callback(&rule.name, rule.on_limit_exceeded.as_deref(), callbacks)?;
            if let Some(callback) = callback {
                limiter = limiter.with_limit_callback(move |ctx| callback(ctx));
            }
            info!(
                policy = %rule.name,
                scope = ?rule.scope,
                limit = rule.limit,
                window_seconds = rule.window_seconds,
                "Rate limiter initialized"
            );
            rate_limiters.push(Arc::new(limiter));
        }

        Ok(Self {
            connection_limiters,
            rate_limiters,
        })
    }

    pub fn connection_limiters(&self) -> &[Arc<ConnectionLimiter>] {
        &self.connection_limiters
    }

    pub fn rate_limiters(&self) -> &[Arc<RateLimiter>] {
        &self.rate_limiters
    }

    pub fn is_empty(&self) -> bool {
        self.connection_limiters.is_empty() && self.rate_limiters.is_empty()
    }

    /// Register every policy as global middleware, connection limiters first.
    pub fn install(&self, mut builder: PipelineBuilder) -> PipelineBuilder {
        for limiter in &self.connection_limiters {
            builder = builder.global(Arc::clone(limiter));
        }
        for limiter in &self.rate_limiters {
            builder = builder.global(Arc::clone(limiter));
        }
        builder
    }
}

fn lookup_callback(
    policy: &str,
    name: Option<&str>,
    callbacks: &LimitCallbacks,
) -> Result<Option<LimitCallback>> {
    let Some(name) = name else {
        return Ok(None);
    };
    callbacks.get(name).cloned().map(Some).ok_or_else(|| {
        TurnstileError::Config(format!(
            "policy '{}': no limit callback named '{}' was supplied",
            policy, name
        ))
    })
}

fn resolve_scope(
    policy: &str,
    kind: ScopeKind,
    resolver: Option<&str>,
    resolvers: &CustomResolvers,
) -> Result<Scope> {
    match kind {
        ScopeKind::PerIdentity => Ok(Scope::PerIdentity),
        ScopeKind::Global => Ok(Scope::Global),
        ScopeKind::Custom => {
            let name = resolver.ok_or_else(|| {
                TurnstileError::Config(format!(
                    "policy '{}': custom scope requires a resolver name",
                    policy
                ))
            })?;
            let resolve = resolvers.get(name).ok_or_else(|| {
                TurnstileError::Config(format!(
                    "policy '{}': no resolver named '{}' was supplied",
                    policy, name
                ))
            })?;
            Ok(Scope::Custom(Arc::clone(resolve)))
        }
    }
}
