//! In-process transport that completes every handshake locally.
//!
//! Used by the smoke binary and by integrators wiring the manager before a
//! real protocol stack is available.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use session_core::{
    Address, Credentials, DisconnectCause, Envelope, SessionHooks, Transport, TransportError,
    TransportSession,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct LoopbackInner {
    sessions_opened: AtomicU64,
    echo_replies: AtomicBool,
    live: Mutex<Option<Arc<LoopbackSession>>>,
}

/// Transport whose sessions open immediately and deliver to themselves.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to each sent message with an inbound copy from the recipient.
    pub fn with_echo_replies(self) -> Self {
        self.inner.echo_replies.store(true, Ordering::Relaxed);
        self
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::Relaxed)
    }

    /// Drop the live session as if the network failed with `cause`.
    pub fn simulate_close(&self, cause: Option<DisconnectCause>) -> bool {
        let live = self
            .inner
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match live {
            Some(session) => session.finish(cause),
            None => false,
        }
    }

    /// Session most recently opened and not yet closed.
    pub fn live_session(&self) -> Option<Arc<LoopbackSession>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        credentials: Credentials,
        hooks: SessionHooks,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let opened = self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(LoopbackSession {
            hooks,
            echo_replies: self.inner.echo_replies.load(Ordering::Relaxed),
            closed: AtomicBool::new(false),
        });
        let sink = &session.hooks.events;
        debug!(generation = sink.generation(), opened, "loopback session opening");

        if !credentials.registered {
            sink.pairing_artifact(format!("2@{}", Uuid::new_v4().simple()));
        }
        let device_id = credentials
            .data
            .get("deviceId")
            .and_then(|value| value.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        sink.credentials_rotated(Credentials {
            version: credentials.version.saturating_add(1),
            registered: true,
            data: serde_json::json!({ "deviceId": device_id, "session": opened }),
        });
        sink.opened();

        *self
            .inner
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&session));
        Ok(session)
    }
}

pub struct LoopbackSession {
    hooks: SessionHooks,
    echo_replies: bool,
    closed: AtomicBool,
}

impl LoopbackSession {
    /// Look up a previously sent or received envelope for re-delivery.
    pub fn redeliver(&self, message_id: &str) -> Option<Envelope> {
        self.hooks.retention.get(message_id)
    }

    fn finish(&self, cause: Option<DisconnectCause>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.hooks.events.closed(cause)
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn send(&self, to: &Address, body: &str) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let message_id = format!("3EB0{}", Uuid::new_v4().simple()).to_uppercase();

        if self.echo_replies {
            self.hooks.events.message(Envelope {
                message_id: format!("3EB0{}", Uuid::new_v4().simple()).to_uppercase(),
                remote: to.jid(),
                from_me: false,
                body: format!("echo: {body}"),
                timestamp_ms: now_millis(),
            });
        }
        Ok(message_id)
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let code: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect::<String>()
            .to_uppercase();
        debug!(%phone, "loopback pairing code issued");
        Ok(code)
    }

    async fn close(&self) {
        // Explicit close reports nothing further.
        self.closed.store(true, Ordering::Release);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
