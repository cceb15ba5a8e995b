use serde::{Deserialize, Serialize};

/// Connection lifecycle state owned by the session manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connect attempt has been made yet.
    Idle,
    /// A transport session exists and is authenticating/handshaking.
    Connecting,
    /// The transport reported the session as open and usable.
    Open,
    /// An explicit disconnect is tearing the session down.
    Closing,
    /// The transport session is gone; a reconnect may be pending.
    Closed,
    /// Terminal condition: automatic reconnects stopped until an explicit connect.
    Disconnected,
}

/// Structured reason attached to a transport close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account logged this device out.
    LoggedOut,
    /// Another client took over the session.
    Replaced,
    /// Stored credentials are invalid or corrupt.
    BadSession,
    /// Transport-level crypto/handshake failure reported as a structured cause.
    HandshakeFailure,
    /// The peer closed the connection.
    ConnectionClosed,
    /// The connection dropped.
    ConnectionLost,
    /// The connection timed out.
    TimedOut,
    /// The peer asked the client to restart the session.
    RestartRequired,
    /// No recognizable classification was supplied.
    Unknown,
}

impl DisconnectReason {
    /// Map a transport status code to a reason.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            440 => Self::Replaced,
            411 | 500 => Self::BadSession,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            515 => Self::RestartRequired,
            _ => Self::Unknown,
        }
    }
}

/// Cause delivered by the transport when a session closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectCause {
    /// Structured classification.
    pub reason: DisconnectReason,
    /// Raw status code, when the transport supplied one.
    pub status_code: Option<u16>,
    /// Human-readable description for logs.
    pub message: String,
}

impl DisconnectCause {
    /// Build a cause with an explicit reason.
    pub fn new(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            status_code: None,
            message: message.into(),
        }
    }

    /// Build a cause from an optional status code, deriving the reason from it.
    pub fn from_status(status_code: Option<u16>, message: impl Into<String>) -> Self {
        let reason = status_code
            .map(DisconnectReason::from_status_code)
            .unwrap_or(DisconnectReason::Unknown);
        Self {
            reason,
            status_code,
            message: message.into(),
        }
    }
}

/// What the manager does after a close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Transient condition; schedule a reconnect while attempts remain.
    Retry,
    /// Session ended for good; do not reconnect.
    Fatal,
    /// Stored credentials must be cleared by an operator before reconnecting.
    ManualIntervention,
}

/// Opaque, versioned session credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    /// Monotonic version bumped by the transport on each rotation.
    pub version: u64,
    /// Whether the device finished pairing with an account.
    pub registered: bool,
    /// Transport-owned key material.
    pub data: serde_json::Value,
}

impl Credentials {
    /// Credentials for a device that has never been paired.
    pub fn fresh() -> Self {
        Self {
            version: 0,
            registered: false,
            data: serde_json::Value::Null,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Normalized transport address (`<digits>@s.whatsapp.net`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address {
    digits: String,
}

/// Server suffix appended to normalized user addresses.
pub const USER_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

impl Address {
    pub(crate) fn from_digits(digits: String) -> Self {
        Self { digits }
    }

    /// Digits-only phone number.
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Transport-specific address string.
    pub fn jid(&self) -> String {
        format!("{}{USER_ADDRESS_SUFFIX}", self.digits)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.jid())
    }
}

/// Message envelope retained for re-delivery and relayed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Transport-assigned message ID.
    pub message_id: String,
    /// Remote address (sender for inbound, recipient for outbound).
    pub remote: String,
    /// `true` when this device authored the message.
    pub from_me: bool,
    /// Text body.
    pub body: String,
    /// Timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
}

/// Events emitted by the session manager to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Lifecycle transition.
    StateChanged {
        /// New state.
        state: ConnectionState,
    },
    /// Transport reported the session open.
    Connected,
    /// Terminal disconnect; no automatic reconnect follows.
    Disconnected {
        /// Classifier decision that ended the session (`Retry` when attempts ran out).
        policy: DisconnectPolicy,
        /// Cause of the last close, when one was supplied.
        cause: Option<DisconnectCause>,
    },
    /// Pairing/QR artifact for the current connect attempt.
    Qr {
        /// Artifact to render or relay.
        artifact: String,
    },
    /// Inbound message from a peer.
    Message(Envelope),
}

/// Point-in-time view of the manager for status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// `true` when the state is `Open`.
    pub connected: bool,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Automatic reconnect attempts used in the current episode.
    pub reconnect_attempts: u32,
    /// Attempt budget per episode.
    pub max_reconnect_attempts: u32,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Last time the session reached `Open`, in milliseconds since Unix epoch.
    pub last_connected_ms: Option<u64>,
    /// Number of envelopes held for re-delivery.
    pub retained_messages: usize,
}
