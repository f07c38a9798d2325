//! Client communication types
//!
//! - `ClientCommand` - Commands sent from the front-end to the coordinator
//! - `ClientEvent` - Events the coordinator reports back
//! - `SharedClientState` - Snapshot the front-end reads without blocking

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::rtp::ExitReason;
use crate::rtsp::{ControlError, SessionError, SessionState};

// ============ Commands (Front-end -> Coordinator) ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Setup,
    Play,
    Pause,
    Teardown,
    /// Release everything and end the coordinator
    Shutdown,
}

// ============ Events (Coordinator -> Front-end) ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Control channel is up
    Connected { peer: SocketAddr },
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    /// A segment was persisted and registered for playback
    SegmentReady { index: u32, bytes: usize },
    ReceiverStopped { reason: ExitReason },
    /// Teardown finished; segment files deleted or left behind
    TornDown { deleted: usize, failed: usize },
    Error { message: String },
    /// Short human-readable status line
    Status(String),
}

pub type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;
pub type ClientEventReceiver = mpsc::UnboundedReceiver<ClientEvent>;
pub type ClientCommandSender = mpsc::UnboundedSender<ClientCommand>;
pub type ClientCommandReceiver = mpsc::UnboundedReceiver<ClientCommand>;

// ============ Errors ============

#[derive(Debug)]
pub enum ClientError {
    Control(ControlError),
    Session(SessionError),
    /// No control connection to send on
    NotConnected,
    /// Data channel could not be bound
    DataChannel(io::Error),
    /// PLAY needs a bound data channel
    DataChannelClosed,
    /// Receiver task panicked or did not stop in time
    Receiver(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Control(e) => write!(f, "{}", e),
            ClientError::Session(e) => write!(f, "{}", e),
            ClientError::NotConnected => write!(f, "Not connected to the server"),
            ClientError::DataChannel(e) => write!(f, "Unable to bind data channel: {}", e),
            ClientError::DataChannelClosed => write!(f, "Data channel is not open"),
            ClientError::Receiver(e) => write!(f, "Receiver error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Control(e) => Some(e),
            ClientError::Session(e) => Some(e),
            ClientError::DataChannel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ControlError> for ClientError {
    fn from(e: ControlError) -> Self {
        ClientError::Control(e)
    }
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        ClientError::Session(e)
    }
}

// ============ Shared State ============

/// Read model of the running client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub connected: bool,
    pub state: SessionState,
    pub session_id: u64,
    /// Bound data-channel port, once SETUP succeeded
    pub data_port: Option<u16>,
    pub highest_sequence: u32,
    pub segments_ready: usize,
    /// Bytes held in memory for the segment being filled
    pub buffered_bytes: usize,
}

/// Thread-safe shared client state
///
/// Written by the coordinator and the pipeline callback, read by the
/// front-end.
#[derive(Debug, Clone, Default)]
pub struct SharedClientState {
    inner: Arc<RwLock<ClientSnapshot>>,
}

impl SharedClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.inner.read().clone()
    }

    pub(super) fn update<F: FnOnce(&mut ClientSnapshot)>(&self, f: F) {
        f(&mut self.inner.write());
    }

    /// Back to a fresh session, keeping the connection flag
    pub(super) fn reset_session(&self) {
        let mut inner = self.inner.write();
        let connected = inner.connected;
        *inner = ClientSnapshot {
            connected,
            ..ClientSnapshot::default()
        };
    }
}

pub fn client_command_channel() -> (ClientCommandSender, ClientCommandReceiver) {
    mpsc::unbounded_channel()
}

pub fn client_event_channel() -> (ClientEventSender, ClientEventReceiver) {
    mpsc::unbounded_channel()
}
