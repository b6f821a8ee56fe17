//! Structured logging setup (ambient, A2).
//!
//! Every suspension point named in the concurrency model (§5) — lock
//! acquisitions, agent dispatch, notifier enqueue, recovery, the per-step
//! timeout wait — is already wrapped in a `tracing` span via
//! `#[instrument]` on the owning method (see `registry.rs`, `router.rs`,
//! `recovery.rs`, `workflow.rs`). This module only owns process-wide
//! subscriber setup, grounded in this codebase's own `main.rs` pattern of
//! an `EnvFilter`-driven `fmt` subscriber, generalized to the two output
//! shapes `RuntimeConfig` distinguishes: human-readable for development,
//! JSON for production log aggregation.

use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;

/// Output shape for the global `tracing` subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for local development.
    Pretty,
    /// Newline-delimited JSON, for log aggregation in production.
    Json,
}

/// Installs the global `tracing` subscriber.
///
/// A no-op (does not install a subscriber) when
/// `config.tracing_enabled` is `false`, so test harnesses that construct
/// a [`RuntimeConfig::test`] don't fight with `test-log`'s own
/// subscriber installation.
///
/// # Panics
/// Panics if a global subscriber has already been installed; this
/// mirrors `tracing`'s own `set_global_default` contract and should only
/// ever be called once, from a binary's `main`.
pub fn init_tracing(config: &RuntimeConfig, format: LogFormat) {
    if !config.tracing_enabled {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conductor=info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_disabled_config_is_a_no_op() {
        let config = RuntimeConfig::test();
        assert!(!config.tracing_enabled);
        // Must not panic or install a subscriber.
        init_tracing(&config, LogFormat::Pretty);
    }
}
