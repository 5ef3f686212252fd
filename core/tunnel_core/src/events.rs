//! Status/log events delivered to the host

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::session::SessionState;

/// Coarse connection state for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl From<SessionState> for ConnectionStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connected => ConnectionStatus::Connected,
            SessionState::Disconnected(_) => ConnectionStatus::Disconnected,
            SessionState::Idle
            | SessionState::TestingNegotiator
            | SessionState::Negotiating
            | SessionState::AwaitingDummyAck => ConnectionStatus::Connecting,
        }
    }
}

/// One line of the session log, stamped with the state at emission time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEvent {
    pub timestamp: SystemTime,
    pub message: String,
    pub state: SessionState,
}

impl TunnelEvent {
    pub fn status(&self) -> ConnectionStatus {
        self.state.into()
    }
}

/// Sending half of the event stream
///
/// Every event is mirrored to the `log` facade. A host that dropped its
/// receiver just stops seeing events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<TunnelEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<TunnelEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, state: SessionState, message: impl Into<String>) {
        let message = message.into();
        match state {
            SessionState::Disconnected(reason) if reason.is_error() => {
                log::warn!("[{:?}] {}", state, message)
            }
            _ => log::info!("[{:?}] {}", state, message),
        }

        let _ = self.tx.send(TunnelEvent {
            timestamp: SystemTime::now(),
            message,
            state,
        });
    }
}
