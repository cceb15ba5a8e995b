use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use session_core::{
    AddressRules, ConnectionInput, ConnectionState, ConnectionStateMachine, ConnectionStatus,
    Credentials, DisconnectCause, DisconnectPolicy, DisconnectReason, Envelope, EventStream,
    ReconnectPolicy, RetentionCache, SendOutcome, SessionError, SessionEvent, SessionEventBus,
    SessionHooks, TaggedTransportEvent, Transport, TransportEvent, TransportEventSink,
    TransportSession, TransportState, classify, classify_send_error_message, normalize_address,
    normalize_pairing_phone,
};
use session_store::{CredentialStore, CredentialStoreError, StoreDiagnostics};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

mod loopback;

pub use loopback::{LoopbackSession, LoopbackTransport};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Tuning for one [`SessionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconnect: ReconnectPolicy,
    pub address_rules: AddressRules,
    /// `None` keeps retained envelopes until the next explicit disconnect.
    pub retention_capacity: Option<usize>,
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            address_rules: AddressRules::default(),
            retention_capacity: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug)]
struct PendingReconnect {
    ticket: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct ActiveSession {
    generation: u64,
    handle: Arc<dyn TransportSession>,
}

struct ManagerCore {
    machine: ConnectionStateMachine,
    session: Option<ActiveSession>,
    generation: u64,
    reconnect_attempts: u32,
    pending_reconnect: Option<PendingReconnect>,
    next_ticket: u64,
    last_connected_ms: Option<u64>,
    terminal_emitted: bool,
}

impl ManagerCore {
    fn new() -> Self {
        Self {
            machine: ConnectionStateMachine::default(),
            session: None,
            generation: 0,
            reconnect_attempts: 0,
            pending_reconnect: None,
            next_ticket: 0,
            last_connected_ms: None,
            terminal_emitted: false,
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.generation)
    }

    fn cancel_pending_reconnect(&mut self) -> bool {
        let Some(pending) = self.pending_reconnect.take() else {
            return false;
        };
        pending.stop.cancel();
        pending.task.abort();
        true
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    retention: RetentionCache,
    events: SessionEventBus,
    config: ManagerConfig,
    connected: AtomicBool,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    core: Mutex<ManagerCore>,
}

/// Owns the single transport session and drives its lifecycle.
///
/// Every state transition, the reconnect counter and the session handle live
/// behind one async mutex. Transport callbacks are drained by a single event
/// pump task that enters the same critical section, so API calls, close
/// events and reconnect timers never interleave.
pub struct SessionManager {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl SessionManager {
    /// Build a manager and start its event pump on the current tokio runtime.
    pub fn spawn(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let retention = match config.retention_capacity {
            Some(capacity) => RetentionCache::with_capacity(capacity),
            None => RetentionCache::unbounded(),
        };

        let shared = Arc::new(Shared {
            transport,
            store,
            retention,
            events: SessionEventBus::new(config.event_buffer),
            config,
            connected: AtomicBool::new(false),
            transport_tx,
            core: Mutex::new(ManagerCore::new()),
        });

        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&shared), transport_rx));
        Self { shared, pump }
    }

    /// Subscribe to `connected`/`disconnected`/`qr`/`message` and state events.
    pub fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    /// Envelopes retained for transport re-delivery.
    pub fn retention(&self) -> &RetentionCache {
        &self.shared.retention
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.core.lock().await.machine.state()
    }

    /// Open a transport session unless one is already open.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        if core.machine.is_open() {
            debug!("connect ignored: session already open");
            return Ok(());
        }

        let mut candidate = core.machine.clone();
        let transition_events = candidate.apply(ConnectionInput::Connect)?;

        let credentials = shared
            .store
            .load()
            .map_err(|err| map_store_error("load", err))?;

        if core.cancel_pending_reconnect() {
            debug!("explicit connect replaced pending reconnect");
        }
        if let Some(previous) = core.session.take() {
            debug!(
                generation = previous.generation,
                "releasing previous transport session"
            );
            previous.handle.close().await;
        }
        core.reconnect_attempts = 0;
        core.terminal_emitted = false;

        info!(
            credentials_version = credentials.version,
            registered = credentials.registered,
            "opening transport session"
        );
        if let Err(err) = shared.open_session(&mut core, credentials).await {
            error!(error = %err, "transport session could not be constructed");
            if core.machine.state() == ConnectionState::Connecting {
                shared.apply_and_emit(&mut core, ConnectionInput::TransportClosed);
            }
            return Err(err);
        }

        shared.commit_transition(&mut core, candidate, transition_events);
        Ok(())
    }

    /// Close the session, drop retained envelopes and cancel pending reconnects.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock().await;
        self.shared.disconnect_locked(&mut core).await
    }

    /// Send a text message to a phone number.
    ///
    /// Lifecycle and validation problems are errors; a transport-level send
    /// failure is reported as [`SendOutcome::Failed`] and leaves the session up.
    pub async fn send_message(&self, to: &str, body: &str) -> Result<SendOutcome, SessionError> {
        let (generation, handle) = {
            let core = self.shared.core.lock().await;
            if !core.machine.is_open() {
                return Err(SessionError::not_connected());
            }
            core.session
                .as_ref()
                .map(|session| (session.generation, Arc::clone(&session.handle)))
                .ok_or_else(SessionError::not_connected)?
        };

        let address = normalize_address(to, &self.shared.config.address_rules)?;
        match handle.send(&address, body).await {
            Ok(message_id) => {
                info!(%message_id, to = %address, "message sent");
                let core = self.shared.core.lock().await;
                // Only the session that sent may still retain; disconnect clears the cache.
                if core.current_generation() == Some(generation) && core.machine.is_open() {
                    self.shared.retention.put(
                        message_id.clone(),
                        Envelope {
                            message_id: message_id.clone(),
                            remote: address.jid(),
                            from_me: true,
                            body: body.to_owned(),
                            timestamp_ms: now_millis(),
                        },
                    );
                } else {
                    debug!(%message_id, generation, "session released during send; not retaining");
                }
                Ok(SendOutcome::Delivered { message_id })
            }
            Err(err) => {
                warn!(to = %address, error = %err, "message send failed");
                Ok(SendOutcome::Failed {
                    error: classify_send_error_message(err.to_string()),
                })
            }
        }
    }

    /// Ask the transport for an out-of-band pairing code.
    pub async fn request_pairing_code(&self, phone: &str) -> Result<String, SessionError> {
        let phone = normalize_pairing_phone(phone)?;
        let handle = {
            let core = self.shared.core.lock().await;
            core.session
                .as_ref()
                .map(|session| Arc::clone(&session.handle))
                .ok_or_else(SessionError::no_active_session)?
        };

        let code = handle
            .request_pairing_code(&phone)
            .await
            .map_err(|err| SessionError::pairing_failed(err.to_string()))?;
        info!(%phone, "pairing code issued");
        Ok(code)
    }

    pub async fn status(&self) -> ConnectionStatus {
        let core = self.shared.core.lock().await;
        ConnectionStatus {
            connected: core.machine.is_open(),
            state: core.machine.state(),
            reconnect_attempts: core.reconnect_attempts,
            max_reconnect_attempts: self.shared.config.reconnect.max_attempts(),
            reconnect_pending: core.pending_reconnect.is_some(),
            last_connected_ms: core.last_connected_ms,
            retained_messages: self.shared.retention.len(),
        }
    }

    /// Inspect local credential state.
    pub fn diagnose_session(&self) -> StoreDiagnostics {
        self.shared.store.diagnose()
    }

    /// Disconnect and wipe stored credentials so the next connect pairs anew.
    pub async fn reset_session(&self) -> Result<(), SessionError> {
        let mut core = self.shared.core.lock().await;
        self.shared.disconnect_locked(&mut core).await?;
        self.shared
            .store
            .reset()
            .map_err(|err| map_store_error("reset", err))?;
        info!("local session state wiped");
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.pump.abort();
        if let Ok(mut core) = self.shared.core.try_lock() {
            core.cancel_pending_reconnect();
        }
    }
}

impl Shared {
    async fn open_session(
        &self,
        core: &mut ManagerCore,
        credentials: Credentials,
    ) -> Result<(), SessionError> {
        core.generation = core.generation.wrapping_add(1);
        let generation = core.generation;
        let hooks = SessionHooks {
            events: TransportEventSink::new(generation, self.transport_tx.clone()),
            retention: self.retention.clone(),
        };

        let handle = self
            .transport
            .open(credentials, hooks)
            .await
            .map_err(|err| SessionError::transport_init(err.to_string()))?;
        debug!(generation, "transport session constructed");
        core.session = Some(ActiveSession { generation, handle });
        Ok(())
    }

    async fn disconnect_locked(&self, core: &mut ManagerCore) -> Result<(), SessionError> {
        if core.session.is_none() && core.pending_reconnect.is_none() {
            debug!("disconnect ignored: no active session");
            return Ok(());
        }

        let mut candidate = core.machine.clone();
        let events = candidate.apply(ConnectionInput::BeginDisconnect)?;
        self.commit_transition(core, candidate, events);

        if core.cancel_pending_reconnect() {
            info!("cancelled pending reconnect");
        }
        if let Some(session) = core.session.take() {
            info!(generation = session.generation, "closing transport session");
            session.handle.close().await;
        }

        self.apply_and_emit(core, ConnectionInput::FinishDisconnect);
        self.retention.clear();
        core.reconnect_attempts = 0;
        Ok(())
    }

    async fn handle_transport_event(self: &Arc<Self>, tagged: TaggedTransportEvent) {
        let mut core = self.core.lock().await;
        if core.current_generation() != Some(tagged.generation) {
            trace!(
                generation = tagged.generation,
                "dropping event from released transport session"
            );
            return;
        }

        match tagged.event {
            TransportEvent::StateChanged {
                state: TransportState::Connecting,
                ..
            } => trace!("transport handshake in progress"),
            TransportEvent::StateChanged {
                state: TransportState::Open,
                ..
            } => {
                if self.apply_and_emit(&mut core, ConnectionInput::TransportOpened) {
                    core.reconnect_attempts = 0;
                    core.last_connected_ms = Some(now_millis());
                    info!(generation = tagged.generation, "session open");
                }
            }
            TransportEvent::StateChanged {
                state: TransportState::Closed,
                cause,
            } => self.handle_closed(&mut core, cause),
            TransportEvent::CredentialsRotated(credentials) => {
                match self.store.save(&credentials) {
                    Ok(()) => debug!(
                        version = credentials.version,
                        "persisted rotated credentials"
                    ),
                    Err(err) => warn!(
                        version = credentials.version,
                        error = %err,
                        "failed persisting rotated credentials; pairing may be lost on restart"
                    ),
                }
            }
            TransportEvent::Message(envelope) => {
                self.retention.put(envelope.message_id.clone(), envelope.clone());
                if envelope.from_me {
                    trace!(message_id = %envelope.message_id, "retained own message");
                } else {
                    debug!(
                        message_id = %envelope.message_id,
                        from = %envelope.remote,
                        "message received"
                    );
                    self.events.emit(SessionEvent::Message(envelope));
                }
            }
            TransportEvent::PairingArtifact(artifact) => {
                info!("pairing artifact issued; scan it with the phone app");
                self.events.emit(SessionEvent::Qr { artifact });
            }
        }
    }

    fn handle_closed(self: &Arc<Self>, core: &mut ManagerCore, cause: Option<DisconnectCause>) {
        core.session = None;
        warn!(
            reason = ?cause.as_ref().map(|cause| cause.reason),
            status_code = ?cause.as_ref().and_then(|cause| cause.status_code),
            detail = cause.as_ref().map(|cause| cause.message.as_str()).unwrap_or(""),
            "transport session closed"
        );
        if !self.apply_and_emit(core, ConnectionInput::TransportClosed) {
            return;
        }
        self.after_close(core, cause);
    }

    /// Decide between a scheduled reconnect and the terminal state. `core` must
    /// already be `Closed`.
    fn after_close(self: &Arc<Self>, core: &mut ManagerCore, cause: Option<DisconnectCause>) {
        let policy = classify(cause.as_ref());
        let reconnect = &self.config.reconnect;

        if policy == DisconnectPolicy::Retry && reconnect.allows(core.reconnect_attempts) {
            core.reconnect_attempts += 1;
            let attempt = core.reconnect_attempts;
            let delay = reconnect.delay_for_attempt(attempt);
            info!(
                attempt,
                max_attempts = reconnect.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            self.schedule_reconnect(core, delay);
            return;
        }

        match policy {
            DisconnectPolicy::Retry => error!(
                max_attempts = reconnect.max_attempts(),
                "reconnect attempts exhausted"
            ),
            DisconnectPolicy::Fatal => warn!("session ended by peer; not reconnecting"),
            DisconnectPolicy::ManualIntervention => error!(
                "stored credentials are unusable; reset the session before reconnecting"
            ),
        }
        self.give_up(core, policy, cause);
    }

    fn give_up(
        &self,
        core: &mut ManagerCore,
        policy: DisconnectPolicy,
        cause: Option<DisconnectCause>,
    ) {
        if !self.apply_and_emit(core, ConnectionInput::GiveUp) {
            return;
        }
        if !core.terminal_emitted {
            core.terminal_emitted = true;
            self.events.emit(SessionEvent::Disconnected { policy, cause });
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut ManagerCore, delay: Duration) {
        core.cancel_pending_reconnect();

        let ticket = core.next_ticket;
        core.next_ticket = core.next_ticket.wrapping_add(1);
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let weak = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_child.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(shared) = weak.upgrade() {
                shared.run_reconnect(ticket).await;
            }
        });

        core.pending_reconnect = Some(PendingReconnect { ticket, stop, task });
    }

    async fn run_reconnect(self: &Arc<Self>, ticket: u64) {
        let mut core = self.core.lock().await;
        let current = core
            .pending_reconnect
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket && !pending.stop.is_cancelled());
        if !current {
            debug!(ticket, "ignoring stale reconnect timer");
            return;
        }
        // Detach rather than abort: this task is the one running.
        core.pending_reconnect = None;

        let mut candidate = core.machine.clone();
        let transition_events = match candidate.apply(ConnectionInput::Reconnect) {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "reconnect skipped");
                return;
            }
        };

        let credentials = match self.store.load() {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(error = %err, "failed loading credentials for reconnect");
                let reason = match err {
                    CredentialStoreError::Corrupt(_) => DisconnectReason::BadSession,
                    _ => DisconnectReason::Unknown,
                };
                self.after_close(&mut core, Some(DisconnectCause::new(reason, err.to_string())));
                return;
            }
        };

        info!(
            attempt = core.reconnect_attempts,
            max_attempts = self.config.reconnect.max_attempts(),
            "reconnecting"
        );
        match self.open_session(&mut core, credentials).await {
            Ok(()) => self.commit_transition(&mut core, candidate, transition_events),
            Err(err) => {
                warn!(error = %err, "reconnect could not construct a transport session");
                self.after_close(
                    &mut core,
                    Some(DisconnectCause::new(DisconnectReason::Unknown, err.message)),
                );
            }
        }
    }

    fn apply_and_emit(&self, core: &mut ManagerCore, input: ConnectionInput) -> bool {
        let mut candidate = core.machine.clone();
        match candidate.apply(input) {
            Ok(events) => {
                self.commit_transition(core, candidate, events);
                true
            }
            Err(err) => {
                warn!(?input, error = %err, "ignoring lifecycle input");
                false
            }
        }
    }

    fn commit_transition(
        &self,
        core: &mut ManagerCore,
        candidate: ConnectionStateMachine,
        events: Vec<SessionEvent>,
    ) {
        core.machine = candidate;
        self.connected
            .store(core.machine.is_open(), Ordering::Release);
        for event in events {
            self.events.emit(event);
        }
    }
}

async fn run_event_pump(
    shared: Weak<Shared>,
    mut transport_rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
) {
    debug!("transport event pump started");
    while let Some(tagged) = transport_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_transport_event(tagged).await;
    }
    debug!("transport event pump exiting");
}

fn map_store_error(operation: &str, err: CredentialStoreError) -> SessionError {
    SessionError::store_unavailable(format!(
        "credential store failed during {operation}: {err}"
    ))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex as StdMutex, atomic::AtomicUsize};

    use async_trait::async_trait;
    use session_core::{Address, SessionErrorCategory, TransportError, recv_event};
    use session_store::InMemoryCredentialStore;
    use tokio::{
        sync::Notify,
        time::{Instant, timeout},
    };

    #[derive(Default)]
    struct ScriptedTransport {
        hooks: StdMutex<Vec<SessionHooks>>,
        open_attempts: AtomicUsize,
        fail_open: AtomicBool,
        fail_send: Arc<AtomicBool>,
        sends: Arc<AtomicUsize>,
        pairing_requests: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        send_gate: Arc<SendGate>,
    }

    /// Holds sends open until the test releases them.
    #[derive(Default)]
    struct SendGate {
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl ScriptedTransport {
        fn opens(&self) -> usize {
            self.open_attempts.load(Ordering::SeqCst)
        }

        fn sink(&self, index: usize) -> TransportEventSink {
            self.hooks.lock().expect("hooks lock")[index].events.clone()
        }

        fn latest_sink(&self) -> TransportEventSink {
            self.hooks
                .lock()
                .expect("hooks lock")
                .last()
                .expect("a session was opened")
                .events
                .clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(
            &self,
            _credentials: Credentials,
            hooks: SessionHooks,
        ) -> Result<Arc<dyn TransportSession>, TransportError> {
            self.open_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(TransportError::Init("socket refused".to_owned()));
            }
            self.hooks.lock().expect("hooks lock").push(hooks);
            Ok(Arc::new(ScriptedSession {
                fail_send: Arc::clone(&self.fail_send),
                sends: Arc::clone(&self.sends),
                pairing_requests: Arc::clone(&self.pairing_requests),
                closes: Arc::clone(&self.closes),
                send_gate: Arc::clone(&self.send_gate),
            }))
        }
    }

    struct ScriptedSession {
        fail_send: Arc<AtomicBool>,
        sends: Arc<AtomicUsize>,
        pairing_requests: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        send_gate: Arc<SendGate>,
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn send(&self, to: &Address, _body: &str) -> Result<String, TransportError> {
            let sent = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            if self.send_gate.hold.load(Ordering::SeqCst) {
                self.send_gate.entered.notify_one();
                self.send_gate.release.notified().await;
            }
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(TransportError::Send("stream errored".to_owned()));
            }
            Ok(format!("msg-{sent}-{}", to.digits()))
        }

        async fn request_pairing_code(&self, _phone: &str) -> Result<String, TransportError> {
            self.pairing_requests.fetch_add(1, Ordering::SeqCst);
            Ok("ABCD1234".to_owned())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SaveFailingStore {
        inner: InMemoryCredentialStore,
    }

    impl CredentialStore for SaveFailingStore {
        fn load(&self) -> Result<Credentials, CredentialStoreError> {
            self.inner.load()
        }

        fn save(&self, _credentials: &Credentials) -> Result<(), CredentialStoreError> {
            Err(CredentialStoreError::Unavailable("disk full".to_owned()))
        }

        fn diagnose(&self) -> StoreDiagnostics {
            self.inner.diagnose()
        }

        fn reset(&self) -> Result<(), CredentialStoreError> {
            self.inner.reset()
        }
    }

    /// Loads fail with `load_error` once it is set.
    #[derive(Default)]
    struct LoadFailingStore {
        inner: InMemoryCredentialStore,
        load_error: StdMutex<Option<CredentialStoreError>>,
    }

    impl LoadFailingStore {
        fn fail_loads_with(&self, err: CredentialStoreError) {
            *self.load_error.lock().expect("load error lock") = Some(err);
        }
    }

    impl CredentialStore for LoadFailingStore {
        fn load(&self) -> Result<Credentials, CredentialStoreError> {
            match self.load_error.lock().expect("load error lock").clone() {
                Some(err) => Err(err),
                None => self.inner.load(),
            }
        }

        fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError> {
            self.inner.save(credentials)
        }

        fn diagnose(&self) -> StoreDiagnostics {
            self.inner.diagnose()
        }

        fn reset(&self) -> Result<(), CredentialStoreError> {
            self.inner.reset()
        }
    }

    fn manager_with(
        transport: &Arc<ScriptedTransport>,
        store: Arc<dyn CredentialStore>,
        reconnect: ReconnectPolicy,
    ) -> SessionManager {
        SessionManager::spawn(
            ManagerConfig {
                reconnect,
                ..ManagerConfig::default()
            },
            transport.clone(),
            store,
        )
    }

    fn default_manager(transport: &Arc<ScriptedTransport>) -> SessionManager {
        manager_with(
            transport,
            Arc::new(InMemoryCredentialStore::default()),
            ReconnectPolicy::fixed(5, 3000),
        )
    }

    fn lost() -> Option<DisconnectCause> {
        Some(DisconnectCause::from_status(Some(408), "connection lost"))
    }

    fn envelope(id: &str, from_me: bool) -> Envelope {
        Envelope {
            message_id: id.to_owned(),
            remote: "51987654321@s.whatsapp.net".to_owned(),
            from_me,
            body: format!("body of {id}"),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    fn is_state(expected: ConnectionState) -> impl Fn(&SessionEvent) -> bool {
        move |event: &SessionEvent| {
            matches!(event, SessionEvent::StateChanged { state } if *state == expected)
        }
    }

    fn is_connected_event(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::Connected)
    }

    fn is_disconnected_event(event: &SessionEvent) -> bool {
        matches!(event, SessionEvent::Disconnected { .. })
    }

    async fn wait_for(
        events: &mut EventStream,
        predicate: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = recv_event(events).await.expect("event bus closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn assert_no_event(
        events: &mut EventStream,
        predicate: impl Fn(&SessionEvent) -> bool,
        window: Duration,
    ) {
        let outcome = timeout(window, async {
            while let Some(event) = recv_event(events).await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        assert!(
            matches!(outcome, Err(_) | Ok(None)),
            "unexpected event: {outcome:?}"
        );
    }

    async fn open_session(
        manager: &SessionManager,
        transport: &ScriptedTransport,
        events: &mut EventStream,
    ) {
        manager.connect().await.expect("connect");
        transport.latest_sink().opened();
        wait_for(events, is_connected_event).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_reconnects_and_resets_counter_on_open() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;
        assert!(manager.is_connected());

        transport.latest_sink().closed(lost());
        wait_for(&mut events, is_state(ConnectionState::Closed)).await;
        assert!(!manager.is_connected());
        let status = manager.status().await;
        assert_eq!(status.reconnect_attempts, 1);
        assert!(status.reconnect_pending);
        assert_eq!(transport.opens(), 1);

        let started = Instant::now();
        wait_for(&mut events, is_state(ConnectionState::Connecting)).await;
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert_eq!(transport.opens(), 2);

        transport.latest_sink().opened();
        wait_for(&mut events, is_connected_event).await;
        let status = manager.status().await;
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.reconnect_pending);
        assert!(status.last_connected_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_ends_with_exactly_one_disconnected_event() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        for attempt in 1..=5u32 {
            transport.latest_sink().closed(lost());
            wait_for(&mut events, is_state(ConnectionState::Connecting)).await;
            assert_eq!(manager.status().await.reconnect_attempts, attempt);
        }

        transport.latest_sink().closed(lost());
        let terminal = wait_for(&mut events, is_disconnected_event).await;
        assert_eq!(
            terminal,
            SessionEvent::Disconnected {
                policy: DisconnectPolicy::Retry,
                cause: lost(),
            }
        );
        assert_eq!(transport.opens(), 6);

        assert_no_event(
            &mut events,
            |event| {
                is_disconnected_event(event) || is_state(ConnectionState::Connecting)(event)
            },
            Duration::from_secs(60),
        )
        .await;
        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.reconnect_pending);
        assert_eq!(transport.opens(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_and_manual_closes_never_schedule_reconnect() {
        let cases = [
            (401, DisconnectPolicy::Fatal),
            (440, DisconnectPolicy::Fatal),
            (411, DisconnectPolicy::ManualIntervention),
            (500, DisconnectPolicy::ManualIntervention),
        ];
        for (code, expected) in cases {
            let transport = Arc::new(ScriptedTransport::default());
            let manager = default_manager(&transport);
            let mut events = manager.subscribe();
            open_session(&manager, &transport, &mut events).await;

            transport
                .latest_sink()
                .closed(Some(DisconnectCause::from_status(Some(code), "stream end")));
            let terminal = wait_for(&mut events, is_disconnected_event).await;
            assert!(
                matches!(terminal, SessionEvent::Disconnected { policy, .. } if policy == expected),
                "status {code} produced {terminal:?}"
            );

            let status = manager.status().await;
            assert_eq!(status.state, ConnectionState::Disconnected);
            assert_eq!(status.reconnect_attempts, 0);
            assert!(!status.reconnect_pending);

            assert_no_event(
                &mut events,
                is_state(ConnectionState::Connecting),
                Duration::from_secs(30),
            )
            .await;
            assert_eq!(transport.opens(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_terminal_state_starts_new_episode() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        transport
            .latest_sink()
            .closed(Some(DisconnectCause::from_status(Some(401), "logged out")));
        wait_for(&mut events, is_disconnected_event).await;

        manager.connect().await.expect("reconnect manually");
        assert_eq!(transport.opens(), 2);
        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        transport.latest_sink().closed(lost());
        wait_for(&mut events, is_state(ConnectionState::Closed)).await;
        assert!(manager.status().await.reconnect_pending);

        manager.disconnect().await.expect("disconnect");
        assert_no_event(
            &mut events,
            |event| {
                is_disconnected_event(event) || is_state(ConnectionState::Connecting)(event)
            },
            Duration::from_secs(30),
        )
        .await;

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Closed);
        assert!(!status.reconnect_pending);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);

        manager.disconnect().await.expect("no-op disconnect");
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_session_and_clears_retention() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        let outcome = manager
            .send_message("987 654 321", "hola")
            .await
            .expect("send");
        let message_id = outcome.message_id().expect("delivered").to_owned();
        let retained = manager.retention().get(&message_id).expect("retained");
        assert_eq!(retained.remote, "51987654321@s.whatsapp.net");
        assert!(retained.from_me);
        assert_eq!(retained.body, "hola");

        manager.disconnect().await.expect("disconnect");
        assert!(manager.retention().is_empty());
        assert!(!manager.is_connected());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_finishing_after_disconnect_does_not_repopulate_retention() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = Arc::new(default_manager(&transport));
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        transport.send_gate.hold.store(true, Ordering::SeqCst);
        let sender = Arc::clone(&manager);
        let in_flight =
            tokio::spawn(async move { sender.send_message("51987654321", "late").await });
        transport.send_gate.entered.notified().await;

        manager.disconnect().await.expect("disconnect");
        assert!(manager.retention().is_empty());

        transport.send_gate.release.notify_one();
        let outcome = in_flight
            .await
            .expect("send task")
            .expect("send was accepted while open");
        assert!(outcome.is_delivered());
        assert!(manager.retention().is_empty());
        assert_eq!(manager.state().await, ConnectionState::Closed);

        // A fresh session starts with an empty cache too.
        open_session(&manager, &transport, &mut events).await;
        assert!(manager.retention().is_empty());
    }

    #[tokio::test]
    async fn send_requires_open_session_before_touching_transport() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);

        let err = manager
            .send_message("51987654321", "hi")
            .await
            .expect_err("idle send must fail");
        assert_eq!(err.code, "not_connected");

        manager.connect().await.expect("connect");
        let err = manager
            .send_message("51987654321", "hi")
            .await
            .expect_err("connecting send must fail");
        assert_eq!(err.code, "not_connected");

        // Lifecycle errors win over address validation.
        let err = manager
            .send_message("not a number", "hi")
            .await
            .expect_err("connecting send must fail");
        assert_eq!(err.code, "not_connected");
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_address_is_rejected_without_sending() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        let err = manager
            .send_message("call me maybe", "hi")
            .await
            .expect_err("letters are rejected");
        assert_eq!(err.category, SessionErrorCategory::Validation);
        assert_eq!(err.code, "invalid_address");
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_send_failure_is_reported_as_failed_outcome() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;
        transport.fail_send.store(true, Ordering::SeqCst);

        let outcome = manager
            .send_message("+51 987-654-321", "hi")
            .await
            .expect("lifecycle ok");
        match outcome {
            SendOutcome::Failed { error } => assert_eq!(error.code, "send_failed"),
            other => panic!("expected failed outcome, got {other:?}"),
        }
        assert!(manager.is_connected());
        assert!(manager.retention().is_empty());
    }

    #[tokio::test]
    async fn pairing_code_validates_phone_then_session() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);

        for phone in ["0987654321", "051987654321", "1"] {
            let err = manager
                .request_pairing_code(phone)
                .await
                .expect_err("malformed phone");
            assert_eq!(err.code, "invalid_phone_format");
        }

        let err = manager
            .request_pairing_code("+51 987 654 321")
            .await
            .expect_err("no session yet");
        assert_eq!(err.code, "no_active_session");
        assert_eq!(transport.pairing_requests.load(Ordering::SeqCst), 0);

        manager.connect().await.expect("connect");
        let code = manager
            .request_pairing_code("+51 987 654 321")
            .await
            .expect("pairing code");
        assert_eq!(code, "ABCD1234");
        assert_eq!(transport.pairing_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        manager.connect().await.expect("second connect");
        assert_eq!(transport.opens(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn transport_init_failure_surfaces_from_connect() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_open.store(true, Ordering::SeqCst);
        let manager = default_manager(&transport);

        let err = manager.connect().await.expect_err("open fails");
        assert_eq!(err.code, "transport_init_failure");
        assert_eq!(err.category, SessionErrorCategory::Transport);
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert!(!manager.status().await.reconnect_pending);
    }

    #[tokio::test]
    async fn connect_surfaces_store_unavailable() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(LoadFailingStore::default());
        store.fail_loads_with(CredentialStoreError::Unavailable("permission denied".to_owned()));
        let manager = manager_with(&transport, store, ReconnectPolicy::default());

        let err = manager.connect().await.expect_err("load fails");
        assert_eq!(err.code, "store_unavailable");
        assert_eq!(err.category, SessionErrorCategory::Storage);
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_store_on_reconnect_needs_manual_intervention() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(LoadFailingStore::default());
        let manager = manager_with(&transport, store.clone(), ReconnectPolicy::fixed(5, 1000));
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        store.fail_loads_with(CredentialStoreError::Corrupt("unexpected end of input".to_owned()));
        transport.latest_sink().closed(lost());
        let terminal = wait_for(&mut events, is_disconnected_event).await;
        match terminal {
            SessionEvent::Disconnected { policy, cause } => {
                assert_eq!(policy, DisconnectPolicy::ManualIntervention);
                assert_eq!(
                    cause.map(|cause| cause.reason),
                    Some(DisconnectReason::BadSession)
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_no_event(
            &mut events,
            is_state(ConnectionState::Connecting),
            Duration::from_secs(30),
        )
        .await;
        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.reconnect_pending);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_consumes_an_attempt() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = manager_with(
            &transport,
            Arc::new(InMemoryCredentialStore::default()),
            ReconnectPolicy::fixed(2, 1000),
        );
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        transport.fail_open.store(true, Ordering::SeqCst);
        transport.latest_sink().closed(lost());
        let terminal = wait_for(&mut events, is_disconnected_event).await;
        assert!(matches!(
            terminal,
            SessionEvent::Disconnected {
                policy: DisconnectPolicy::Retry,
                ..
            }
        ));
        assert_eq!(transport.opens(), 3);
        assert_eq!(manager.status().await.reconnect_attempts, 2);
    }

    #[tokio::test]
    async fn rotated_credentials_are_persisted() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(InMemoryCredentialStore::default());
        let manager = manager_with(&transport, store.clone(), ReconnectPolicy::default());
        let mut events = manager.subscribe();

        manager.connect().await.expect("connect");
        let sink = transport.latest_sink();
        sink.credentials_rotated(Credentials {
            version: 7,
            registered: true,
            data: serde_json::json!({ "me": "51987654321" }),
        });
        sink.opened();
        wait_for(&mut events, is_connected_event).await;

        let stored = store.load().expect("load");
        assert_eq!(stored.version, 7);
        assert!(manager.diagnose_session().registered);
    }

    #[tokio::test]
    async fn credential_save_failure_keeps_session_running() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = manager_with(
            &transport,
            Arc::new(SaveFailingStore::default()),
            ReconnectPolicy::default(),
        );
        let mut events = manager.subscribe();

        manager.connect().await.expect("connect");
        let sink = transport.latest_sink();
        sink.credentials_rotated(Credentials {
            version: 1,
            registered: true,
            data: serde_json::Value::Null,
        });
        sink.opened();
        wait_for(&mut events, is_connected_event).await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_released_sessions_are_ignored() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        manager.disconnect().await.expect("disconnect");
        manager.connect().await.expect("connect again");
        let stale = transport.sink(0);
        stale.closed(lost());
        stale.message(envelope("stale-1", false));
        transport.sink(1).opened();
        wait_for(&mut events, is_connected_event).await;

        let status = manager.status().await;
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.reconnect_pending);
        assert!(manager.retention().get("stale-1").is_none());
    }

    #[tokio::test]
    async fn inbound_messages_are_retained_and_own_messages_not_emitted() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        let sink = transport.latest_sink();
        sink.message(envelope("own-1", true));
        sink.message(envelope("peer-1", false));

        let first = wait_for(&mut events, |event| {
            matches!(event, SessionEvent::Message(_))
        })
        .await;
        assert_eq!(first, SessionEvent::Message(envelope("peer-1", false)));
        assert_eq!(manager.retention().len(), 2);
        assert!(manager.retention().get("own-1").is_some());
    }

    #[tokio::test]
    async fn pairing_artifact_is_relayed_as_qr_event() {
        let transport = Arc::new(ScriptedTransport::default());
        let manager = default_manager(&transport);
        let mut events = manager.subscribe();

        manager.connect().await.expect("connect");
        transport.latest_sink().pairing_artifact("2@abc,def");
        let event = wait_for(&mut events, |event| matches!(event, SessionEvent::Qr { .. })).await;
        assert_eq!(
            event,
            SessionEvent::Qr {
                artifact: "2@abc,def".to_owned()
            }
        );
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn reset_session_disconnects_and_wipes_store() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(InMemoryCredentialStore::with_credentials(Credentials {
            version: 3,
            registered: true,
            data: serde_json::Value::Null,
        }));
        let manager = manager_with(&transport, store.clone(), ReconnectPolicy::default());
        let mut events = manager.subscribe();
        open_session(&manager, &transport, &mut events).await;

        manager.reset_session().await.expect("reset");
        assert!(!manager.is_connected());
        assert_eq!(store.load().expect("load"), Credentials::fresh());
        assert!(!manager.diagnose_session().has_credentials);
    }

    #[tokio::test]
    async fn loopback_transport_drives_full_lifecycle() {
        let transport = Arc::new(LoopbackTransport::new().with_echo_replies());
        let store = Arc::new(InMemoryCredentialStore::default());
        let manager = SessionManager::spawn(
            ManagerConfig::default(),
            transport.clone(),
            store.clone(),
        );
        let mut events = manager.subscribe();

        manager.connect().await.expect("connect");
        wait_for(&mut events, |event| matches!(event, SessionEvent::Qr { .. })).await;
        wait_for(&mut events, is_connected_event).await;
        assert!(store.load().expect("load").registered);

        let outcome = manager
            .send_message("987654321", "ping")
            .await
            .expect("send");
        assert!(outcome.is_delivered());
        let echo = wait_for(&mut events, |event| matches!(event, SessionEvent::Message(_))).await;
        assert!(matches!(echo, SessionEvent::Message(envelope) if envelope.body == "echo: ping"));

        let live = transport.live_session().expect("live session");
        let message_id = outcome.message_id().expect("id");
        assert_eq!(
            live.redeliver(message_id).map(|envelope| envelope.body),
            Some("ping".to_owned())
        );

        manager.disconnect().await.expect("disconnect");
        assert_eq!(transport.sessions_opened(), 1);
    }
}
