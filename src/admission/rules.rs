//! Admission policy rules as they appear in configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Scope names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    PerIdentity,
    Global,
    Custom,
}

fn default_scope() -> ScopeKind {
    ScopeKind::PerIdentity
}

fn default_capacity() -> u32 {
    10_000
}

/// A fixed-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Policy name, used in logs
    pub name: String,
    /// How requests are partitioned
    #[serde(default = "default_scope")]
    pub scope: ScopeKind,
    /// Name of the custom resolver (custom scope only)
    #[serde(default)]
    pub resolver: Option<String>,
    /// Requests allowed per window and key
    pub limit: u32,
    /// Window length in seconds
    pub window_seconds: u32,
    /// Maximum distinct keys tracked
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Name of the callback producing the rejection reply
    #[serde(default)]
    pub on_limit_exceeded: Option<String>,
}

/// A concurrent in-flight limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLimitRule {
    /// Policy name, used in logs
    pub name: String,
    /// How requests are partitioned
    #[serde(default = "default_scope")]
    pub scope: ScopeKind,
    /// Name of the custom resolver (custom scope only)
    #[serde(default)]
    pub resolver: Option<String>,
    /// In-flight requests allowed per key
    pub max_connections: u32,
    /// In-flight requests allowed across all keys
    #[serde(default)]
    pub global_max: Option<u32>,
    /// Maximum distinct keys tracked
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Name of the callback producing the rejection reply
    #[serde(default)]
    pub on_limit_exceeded: Option<String>,
}

fn check_scope(policy: &str, scope: ScopeKind, resolver: Option<&str>) -> Result<()> {
    match (scope, resolver) {
        (ScopeKind::Custom, None) => Err(TurnstileError::Config(format!(
            "policy '{}': custom scope requires a resolver name",
            policy
        ))),
        (ScopeKind::PerIdentity | ScopeKind::Global, Some(resolver)) => {
            Err(TurnstileError::Config(format!(
                "policy '{}': resolver '{}' is only valid with custom scope",
                policy, resolver
            )))
        }
        _ => Ok(()),
    }
}

fn check_positive(policy: &str, field: &str, value: u32) -> Result<()> {
    if value == 0 {
        return Err(TurnstileError::Config(format!(
            "policy '{}': {} must be greater than zero",
            policy, field
        )));
    }
    Ok(())
}

impl RateLimitRule {
    /// Check the rule for invalid or conflicting options.
    pub fn validate(&self) -> Result<()> {
        check_scope(&self.name, self.scope, self.resolver.as_deref())?;
        check_positive(&self.name, "limit", self.limit)?;
        check_positive(&self.name, "window_seconds", self.window_seconds)?;
        check_positive(&self.name, "capacity", self.capacity)
    }
}

impl ConnectionLimitRule {
    /// Check the rule for invalid or conflicting options.
    pub fn validate(&self) -> Result<()> {
        check_scope(&self.name, self.scope, self.resolver.as_deref())?;
        check_positive(&self.name, "max_connections", self.max_connections)?;
        check_positive(&self.name, "capacity", self.capacity)?;
        if let Some(global_max) = self.global_max {
            if global_max < self.max_connections {
                return Err(TurnstileError::Config(format!(
                    "policy '{}': global_max ({}) is below max_connections ({})",
                    self.name, global_max, self.max_connections
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_rule(yaml: &str) -> RateLimitRule {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_rate_rule_defaults() {
        let rule = rate_rule("name: r\nlimit: 10\nwindow_seconds: 60\n");

        assert_eq!(rule.scope, ScopeKind::PerIdentity);
        assert_eq!(rule.capacity, 10_000);
        assert!(rule.resolver.is_none());
        assert!(rule.on_limit_exceeded.is_none());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_scope_names() {
        let rule = rate_rule("name: r\nscope: global\nlimit: 1\nwindow_seconds: 1\n");
        assert_eq!(rule.scope, ScopeKind::Global);

        let bad: std::result::Result<RateLimitRule, _> =
            serde_yaml::from_str("name: r\nscope: planet\nlimit: 1\nwindow_seconds: 1\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_custom_scope_requires_resolver() {
        let rule = rate_rule("name: r\nscope: custom\nlimit: 1\nwindow_seconds: 1\n");
        assert!(rule.validate().is_err());

        let rule = rate_rule("name: r\nscope: custom\nresolver: api_key\nlimit: 1\nwindow_seconds: 1\n");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_resolver_conflicts_with_builtin_scope() {
        let rule = rate_rule("name: r\nscope: global\nresolver: api_key\nlimit: 1\nwindow_seconds: 1\n");
        assert!(matches!(rule.validate(), Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        let rule = rate_rule("name: r\nlimit: 1\nwindow_seconds: 0\n");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_limit_callback_name() {
        let rule = rate_rule("name: r\nlimit: 1\nwindow_seconds: 1\non_limit_exceeded: drop_connection\n");
        assert_eq!(rule.on_limit_exceeded.as_deref(), Some("drop_connection"));

        let rule: ConnectionLimitRule =
            serde_yaml::from_str("name: c\nmax_connections: 1\non_limit_exceeded: busy\n").unwrap();
        assert_eq!(rule.on_limit_exceeded.as_deref(), Some("busy"));
    }

    #[test]
    fn test_connection_rule_global_max_conflict() {
        let rule: ConnectionLimitRule =
            serde_yaml::from_str("name: c\nmax_connections: 10\nglobal_max: 5\n").unwrap();
        assert!(rule.validate().is_err());

        let rule: ConnectionLimitRule =
            serde_yaml::from_str("name: c\nmax_connections: 10\nglobal_max: 50\n").unwrap();
        assert!(rule.validate().is_ok());
    }
}
