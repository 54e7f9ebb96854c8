//! Scope key resolution.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::pipeline::RequestContext;
use crate::store::ScopeKey;

/// Key shared by every request under a [`Scope::Global`] policy.
pub const GLOBAL_SCOPE_KEY: &str = "__global__";

/// Key used when a custom resolver yields nothing.
pub const DEFAULT_CUSTOM_KEY: &str = "__default__";

/// Header consulted for the original client when the peer is a trusted proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Caller-supplied key function for [`Scope::Custom`].
pub type ScopeFn = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// How a policy partitions requests.
#[derive(Clone)]
pub enum Scope {
    /// One partition per client address.
    PerIdentity,
    /// A single partition shared by every request.
    Global,
    /// Partition chosen by an application function.
    Custom(ScopeFn),
}

impl Scope {
    /// Build a custom scope from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        Scope::Custom(Arc::new(f))
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::PerIdentity => f.write_str("PerIdentity"),
            Scope::Global => f.write_str("Global"),
            Scope::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Peer addresses allowed to report the client address via `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    addrs: Arc<HashSet<IpAddr>>,
}

impl TrustedProxies {
    /// Create a trusted set from addresses.
    ///
    /// IPv4-mapped IPv6 addresses are stored in their IPv4 form.
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: Arc::new(addrs.into_iter().map(|addr| addr.to_canonical()).collect()),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(&addr.to_canonical())
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The address identifying the client of `ctx`.
    ///
    /// For a trusted peer this is the left-most entry of the forwarded-for
    /// chain that parses as an IP literal; otherwise, or if no entry
    /// parses, it is the peer address itself. A dual-stack listener reports
    /// IPv4 clients as `::ffff:a.b.c.d`; those come back in IPv4 form.
    pub fn client_ip(&self, ctx: &RequestContext) -> IpAddr {
        let peer = ctx.client_address().to_canonical();
        if !self.contains(&peer) {
            return peer;
        }

        ctx.header_values(FORWARDED_FOR)
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find_map(|candidate| candidate.parse::<IpAddr>().ok())
            .map(|addr| addr.to_canonical())
            .unwrap_or(peer)
    }
}

/// Derives the [`ScopeKey`] a policy acts on.
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    scope: Scope,
    trusted: TrustedProxies,
}

impl ScopeResolver {
    /// Create a resolver for a scope.
    pub fn new(scope: Scope, trusted: TrustedProxies) -> Self {
        Self { scope, trusted }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Resolve the key for a request.
    pub fn resolve(&self, ctx: &RequestContext) -> ScopeKey {
        match &self.scope {
            Scope::PerIdentity => ScopeKey::new(self.trusted.client_ip(ctx).to_string()),
            Scope::Global => ScopeKey::from(GLOBAL_SCOPE_KEY),
            Scope::Custom(resolve) => match resolve(ctx) {
                Some(key) if !key.is_empty() => ScopeKey::new(key),
                _ => ScopeKey::from(DEFAULT_CUSTOM_KEY),
            },
        }
    }
}
