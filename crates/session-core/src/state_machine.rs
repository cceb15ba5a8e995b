use crate::{
    error::SessionError,
    types::{ConnectionState, SessionEvent},
};

/// Inputs that drive the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Explicit `connect()` call opened a new transport session.
    Connect,
    /// Reconnect timer fired and a new transport session was opened.
    Reconnect,
    /// Transport reported the session open.
    TransportOpened,
    /// Transport reported the session closed.
    TransportClosed,
    /// Retries stopped; the session is terminally disconnected.
    GiveUp,
    /// Explicit `disconnect()` started tearing the session down.
    BeginDisconnect,
    /// Explicit teardown finished.
    FinishDisconnect,
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn apply(&mut self, input: ConnectionInput) -> Result<Vec<SessionEvent>, SessionError> {
        use ConnectionState::*;

        match input {
            ConnectionInput::Connect => self.transition_from_any_of(
                &[Idle, Connecting, Closed, Disconnected],
                Connecting,
                "connect",
            ),
            ConnectionInput::Reconnect => {
                self.transition_from_any_of(&[Closed], Connecting, "reconnect")
            }
            ConnectionInput::TransportOpened => {
                let mut events =
                    self.transition_from_any_of(&[Connecting], Open, "transport_open")?;
                events.push(SessionEvent::Connected);
                Ok(events)
            }
            ConnectionInput::TransportClosed => {
                self.transition_from_any_of(&[Connecting, Open], Closed, "transport_close")
            }
            ConnectionInput::GiveUp => {
                self.transition_from_any_of(&[Closed], Disconnected, "give_up")
            }
            ConnectionInput::BeginDisconnect => self.transition_from_any_of(
                &[Connecting, Open, Closed, Disconnected],
                Closing,
                "disconnect",
            ),
            ConnectionInput::FinishDisconnect => {
                self.transition_from_any_of(&[Closing], Closed, "finish_disconnect")
            }
        }
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if !expected.contains(&self.state) {
            return Err(SessionError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![SessionEvent::StateChanged { state: next }])
    }
}
