//! Core session contract shared by the lifecycle runtime and its callers.
//!
//! This crate defines the lifecycle model, disconnect classification, the
//! retained-message cache, address normalization and the transport seam.

/// Broadcast event bus primitives.
pub mod channel;
/// Disconnect cause classification.
pub mod classifier;
/// Stable session error types.
pub mod error;
/// Address/phone normalization and send outcomes.
pub mod normalization;
/// Retained message cache for transport re-delivery.
pub mod retention;
/// Reconnect delay and attempt budget.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Transport contract consumed by the runtime.
pub mod transport;
/// Lifecycle, credential and event types.
pub mod types;

pub use channel::{EventStream, SessionEventBus, recv_event};
pub use classifier::classify;
pub use error::{SessionError, SessionErrorCategory};
pub use normalization::{
    AddressRules, SendOutcome, classify_send_error_message, normalize_address,
    normalize_pairing_phone,
};
pub use retention::RetentionCache;
pub use retry::{BackoffMode, ReconnectPolicy};
pub use state_machine::{ConnectionInput, ConnectionStateMachine};
pub use transport::{
    SessionHooks, TaggedTransportEvent, Transport, TransportError, TransportEvent,
    TransportEventSink, TransportSession, TransportState,
};
pub use types::{
    Address, ConnectionState, ConnectionStatus, Credentials, DisconnectCause, DisconnectPolicy,
    DisconnectReason, Envelope, SessionEvent,
};
