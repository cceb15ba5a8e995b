//! Seam between the lifecycle manager and the opaque protocol transport.
//!
//! A [`Transport`] builds one [`TransportSession`] per connect attempt. The
//! session reports everything asynchronous (state changes, credential
//! rotation, inbound messages, pairing artifacts) through the
//! [`TransportEventSink`] it was handed, and reads re-delivery candidates from
//! the shared [`RetentionCache`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    retention::RetentionCache,
    types::{Address, Credentials, DisconnectCause, Envelope},
};

/// Connection state as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// Callback surface of a transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// `cause` is only meaningful for `Closed`.
    StateChanged {
        state: TransportState,
        cause: Option<DisconnectCause>,
    },
    CredentialsRotated(Credentials),
    Message(Envelope),
    PairingArtifact(String),
}

/// Transport event tagged with the session generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedTransportEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sender half handed to a transport session for its callbacks.
///
/// Every event is tagged with the generation of the session it belongs to, so
/// the manager can drop events from sessions it already released.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedTransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the session open.
    pub fn opened(&self) -> bool {
        self.send(TransportEvent::StateChanged {
            state: TransportState::Open,
            cause: None,
        })
    }

    /// Report the session closed, with the cause when known.
    pub fn closed(&self, cause: Option<DisconnectCause>) -> bool {
        self.send(TransportEvent::StateChanged {
            state: TransportState::Closed,
            cause,
        })
    }

    pub fn credentials_rotated(&self, credentials: Credentials) -> bool {
        self.send(TransportEvent::CredentialsRotated(credentials))
    }

    pub fn message(&self, envelope: Envelope) -> bool {
        self.send(TransportEvent::Message(envelope))
    }

    pub fn pairing_artifact(&self, artifact: impl Into<String>) -> bool {
        self.send(TransportEvent::PairingArtifact(artifact.into()))
    }

    /// Deliver an event; `false` once the manager stopped listening.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedTransportEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Everything a transport session gets from the manager on open.
#[derive(Debug, Clone)]
pub struct SessionHooks {
    pub events: TransportEventSink,
    pub retention: RetentionCache,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport init failed: {0}")]
    Init(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("pairing code request failed: {0}")]
    Pairing(String),
    #[error("transport session is closed")]
    Closed,
}

/// Factory for transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Construct a session from stored credentials.
    ///
    /// Returning `Ok` means a session object exists; it reports `Open` or
    /// `Closed` later through `hooks.events`.
    async fn open(
        &self,
        credentials: Credentials,
        hooks: SessionHooks,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// One live protocol session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Deliver a text body, returning the transport-assigned message ID.
    async fn send(&self, to: &Address, body: &str) -> Result<String, TransportError>;

    /// Request an out-of-band pairing code for a digits-only E.164 phone.
    async fn request_pairing_code(&self, phone: &str) -> Result<String, TransportError>;

    /// Close the session. Must not report further events afterwards.
    async fn close(&self);
}
