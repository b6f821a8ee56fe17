//! `RuntimeConfig`: the ambient, layered configuration surface shared by
//! the registry, router, and workflow manager.
//!
//! Grounded in `message_router/config.rs`'s preset style
//! (`development()`/`production()`/`testing()` constructors over a plain
//! struct) generalized to this crate's smaller settings surface, plus an
//! explicit `from_env()` layering step in the same spirit as that file's
//! `ConfigError`-validated builder.

use std::env;
use std::time::Duration;

/// Layered runtime configuration consumed by the coordination core.
///
/// Presets are pure functions over literal defaults; no environment access
/// happens implicitly. Call [`RuntimeConfig::from_env`] explicitly to layer
/// `RUNTIME_*` environment variables over a chosen preset.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Default per-step timeout used by the workflow manager when a step
    /// does not carry its own `timeout` parameter.
    pub default_step_timeout: Duration,
    /// Hard deadline bounding `recover_agent`.
    pub recovery_deadline: Duration,
    /// TTL of the capability router's scoring cache.
    pub routing_cache_ttl: Duration,
    /// TTL of the workflow manager's capability cache.
    pub workflow_cache_ttl: Duration,
    /// Default `min_score` floor applied by `find_best_agent` when the
    /// caller does not specify one.
    pub default_min_score: f64,
    /// Maximum retained message-history entries per agent.
    pub max_history: usize,
    /// Whether `tracing` spans/events are expected to be emitted.
    pub tracing_enabled: bool,
    /// Whether the capability router collects routing metrics
    /// (`RoutingMetrics`, `CoverageReport` usage counts).
    pub metrics_enabled: bool,
    /// Whether the workflow manager may fabricate a generic worker agent
    /// when a step's capability has no registered candidate.
    pub allow_phantom_workers: bool,
}

impl RuntimeConfig {
    /// Permissive defaults for local development: phantom workers enabled,
    /// generous timeouts, full observability.
    #[must_use]
    pub fn development() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(5),
            recovery_deadline: Duration::from_secs(30),
            routing_cache_ttl: Duration::from_secs(60),
            workflow_cache_ttl: Duration::from_secs(60),
            default_min_score: 0.5,
            max_history: 256,
            tracing_enabled: true,
            metrics_enabled: true,
            allow_phantom_workers: true,
        }
    }

    /// Fast, deterministic settings for the test suite: short caches and
    /// timeouts so tests don't need to sleep long to observe expiry.
    #[must_use]
    pub fn test() -> Self {
        Self {
            default_step_timeout: Duration::from_millis(500),
            recovery_deadline: Duration::from_secs(2),
            routing_cache_ttl: Duration::from_millis(100),
            workflow_cache_ttl: Duration::from_millis(100),
            default_min_score: 0.5,
            max_history: 64,
            tracing_enabled: false,
            metrics_enabled: true,
            allow_phantom_workers: true,
        }
    }

    /// Conservative settings for production: phantom workers disabled so a
    /// missing capability surfaces as an assembly failure instead of being
    /// silently papered over.
    #[must_use]
    pub fn production() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(5),
            recovery_deadline: Duration::from_secs(30),
            routing_cache_ttl: Duration::from_secs(60),
            workflow_cache_ttl: Duration::from_secs(60),
            default_min_score: 0.5,
            max_history: 256,
            tracing_enabled: true,
            metrics_enabled: true,
            allow_phantom_workers: false,
        }
    }

    /// Layers `RUNTIME_*` environment variables over `self`. Unset or
    /// unparsable variables leave the existing value untouched.
    #[must_use]
    pub fn layered_from_env(mut self) -> Self {
        if let Some(v) = env_u64("RUNTIME_DEFAULT_STEP_TIMEOUT_MS") {
            self.default_step_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("RUNTIME_RECOVERY_DEADLINE_MS") {
            self.recovery_deadline = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("RUNTIME_ROUTING_CACHE_TTL_MS") {
            self.routing_cache_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("RUNTIME_WORKFLOW_CACHE_TTL_MS") {
            self.workflow_cache_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env::var("RUNTIME_DEFAULT_MIN_SCORE")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
        {
            self.default_min_score = v;
        }
        if let Some(v) = env_u64("RUNTIME_MAX_HISTORY") {
            self.max_history = v as usize;
        }
        if let Some(v) = env_bool("RUNTIME_TRACING_ENABLED") {
            self.tracing_enabled = v;
        }
        if let Some(v) = env_bool("RUNTIME_METRICS_ENABLED") {
            self.metrics_enabled = v;
        }
        if let Some(v) = env_bool("RUNTIME_ALLOW_PHANTOM_WORKERS") {
            self.allow_phantom_workers = v;
        }
        self
    }

    /// Builds the `development` preset layered with any `RUNTIME_*`
    /// environment overrides present in the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::development().layered_from_env()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::development()
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|s| s.parse::<bool>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_disables_phantom_workers() {
        assert!(!RuntimeConfig::production().allow_phantom_workers);
        assert!(RuntimeConfig::development().allow_phantom_workers);
    }

    #[test]
    fn env_override_layers_over_preset() {
        // SAFETY: test-only mutation of the process environment, scoped to
        // this single-threaded assertion.
        unsafe {
            env::set_var("RUNTIME_ALLOW_PHANTOM_WORKERS", "false");
        }
        let cfg = RuntimeConfig::development().layered_from_env();
        assert!(!cfg.allow_phantom_workers);
        unsafe {
            env::remove_var("RUNTIME_ALLOW_PHANTOM_WORKERS");
        }
    }
}
