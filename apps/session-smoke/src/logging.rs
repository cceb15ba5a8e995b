//! Tracing/logging bootstrap for the smoke binary.

use std::env;

use tracing::Span;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,session_runtime=debug,walink_smoke=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `WALINK_LOG`
/// 3) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(env_filter)
        .try_init();
}

/// Span carrying `session_id` so lines from concurrent gateways can be told apart.
pub fn session_span(session_id: &str) -> Span {
    tracing::info_span!("session", session_id = %session_id)
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("WALINK_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}
