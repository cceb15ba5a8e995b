use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorCategory {
    /// Caller input rejected before reaching the transport.
    Validation,
    /// Operation not allowed in the current lifecycle state.
    State,
    /// Transport could not be constructed or refused a request.
    Transport,
    /// Credential persistence failure.
    Storage,
    /// Invariant break inside the manager.
    Internal,
}

/// Stable error payload returned by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// High-level error category.
    pub category: SessionErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SessionError {
    /// Construct a new session error.
    pub fn new(
        category: SessionErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The transport session could not be constructed.
    pub fn transport_init(message: impl Into<String>) -> Self {
        Self::new(
            SessionErrorCategory::Transport,
            "transport_init_failure",
            message,
        )
    }

    /// Operation requires an open session.
    pub fn not_connected() -> Self {
        Self::new(
            SessionErrorCategory::State,
            "not_connected",
            "session is not connected",
        )
    }

    /// Operation requires an existing transport session handle.
    pub fn no_active_session() -> Self {
        Self::new(
            SessionErrorCategory::State,
            "no_active_session",
            "no transport session exists; call connect first",
        )
    }

    /// Target address could not be normalized.
    pub fn invalid_address(input: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            SessionErrorCategory::Validation,
            "invalid_address",
            format!("invalid target address '{input}': {reason}"),
        )
    }

    /// Pairing phone number is not E.164 digits-only.
    pub fn invalid_phone_format(input: &str) -> Self {
        Self::new(
            SessionErrorCategory::Validation,
            "invalid_phone_format",
            format!(
                "phone number '{input}' must be E.164 digits without '+' (for example 51987654321)"
            ),
        )
    }

    /// Credential store could not be read or written.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCategory::Storage, "store_unavailable", message)
    }

    /// Transport failed to produce a pairing code.
    pub fn pairing_failed(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCategory::Transport, "pairing_failed", message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SessionErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }
}
