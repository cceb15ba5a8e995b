use crate::types::{DisconnectCause, DisconnectPolicy, DisconnectReason};

/// Decide how the manager reacts to a transport close.
///
/// Only causes that mean the stored credentials are unusable suppress
/// retries; everything transient, including an absent cause, retries.
pub fn classify(cause: Option<&DisconnectCause>) -> DisconnectPolicy {
    let Some(cause) = cause else {
        return DisconnectPolicy::Retry;
    };

    match cause.reason {
        DisconnectReason::LoggedOut | DisconnectReason::Replaced => DisconnectPolicy::Fatal,
        DisconnectReason::BadSession | DisconnectReason::HandshakeFailure => {
            DisconnectPolicy::ManualIntervention
        }
        DisconnectReason::ConnectionClosed
        | DisconnectReason::ConnectionLost
        | DisconnectReason::TimedOut
        | DisconnectReason::RestartRequired
        | DisconnectReason::Unknown => DisconnectPolicy::Retry,
    }
}
