//! Datagram receiver
//!
//! One receiver task runs per play phase. It owns the buffer pipeline while
//! it runs and hands it back through its `JoinHandle` when it exits.
//!
//! Pause and teardown are checked before every read. The read itself races
//! a wake-up from the signals and is bounded by a timeout, so the task stops
//! promptly whether the server keeps sending or has gone quiet:
//!
//! ```text
//! pause requested?        -> exit Paused
//! teardown acknowledged?  -> exit TornDown
//! recv (timeout) --data-----> decode seq, track max, pipeline.append()
//!                --wake-----> re-check
//!                --timeout--> re-check
//!                --error----> exit TransportFailed (treated as teardown)
//! ```
//!
//! Packets are forwarded in arrival order. Out-of-order and duplicate
//! datagrams are neither reordered nor dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::packet::RtpPacket;
use crate::cache::BufferPipeline;

/// Receive buffer size per datagram
pub const RECV_BUFFER_SIZE: usize = 20_480;

/// Default bound on a single receive
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(500);

// ============ Data channel ============

/// Bound datagram socket shared between play phases
#[derive(Debug)]
pub struct DataChannel {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl DataChannel {
    /// Bind on all interfaces at `port` (0 lets the OS choose)
    pub async fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        info!("Data channel bound on {}", local_addr);
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ============ Signals ============

/// Flags shared between the coordinator, the receiver and the pipeline
#[derive(Debug, Default)]
pub struct ReceiverSignals {
    /// One-shot pause request; cleared when the next phase starts
    pause_requested: AtomicBool,
    /// Persistent once the server confirms teardown
    teardown_acknowledged: AtomicBool,
    /// Whether a receiver is actively feeding the pipeline
    receiving: AtomicBool,
    /// Highest data sequence number seen this phase
    highest_sequence: AtomicU32,
    /// Interrupts a pending receive when pause or teardown is signalled
    wake: Notify,
}

impl ReceiverSignals {
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn acknowledge_teardown(&self) {
        self.teardown_acknowledged.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_torn_down(&self) -> bool {
        self.teardown_acknowledged.load(Ordering::SeqCst)
    }

    pub fn set_receiving(&self, receiving: bool) {
        self.receiving.store(receiving, Ordering::SeqCst);
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Record a sequence number; returns true if it is a new maximum
    pub fn observe_sequence(&self, sequence: u16) -> bool {
        let sequence = sequence as u32;
        self.highest_sequence.fetch_max(sequence, Ordering::SeqCst) < sequence
    }

    pub fn highest_sequence(&self) -> u32 {
        self.highest_sequence.load(Ordering::SeqCst)
    }

    /// Pause wins over teardown when both are set
    fn exit_reason(&self) -> Option<ExitReason> {
        if self.is_pause_requested() {
            Some(ExitReason::Paused)
        } else if self.is_torn_down() {
            Some(ExitReason::TornDown)
        } else {
            None
        }
    }
}

// ============ Worker ============

/// Why a receiver task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Pause confirmed; the socket stays open for the next phase
    Paused,
    /// Teardown confirmed; the socket is released
    TornDown,
    /// Socket error outside teardown; treated like teardown
    TransportFailed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Paused => write!(f, "paused"),
            ExitReason::TornDown => write!(f, "torn down"),
            ExitReason::TransportFailed => write!(f, "transport failed"),
        }
    }
}

/// What a finished receiver hands back
#[derive(Debug)]
pub struct ReceiverExit {
    pub pipeline: BufferPipeline,
    pub reason: ExitReason,
    pub packets: u64,
}

/// Start a receiver for one play phase
///
/// Clears any stale pause request and marks the pipeline as receiving
/// before the task starts.
pub fn spawn_receiver(
    channel: Arc<DataChannel>,
    pipeline: BufferPipeline,
    signals: Arc<ReceiverSignals>,
    recv_timeout: Duration,
) -> JoinHandle<ReceiverExit> {
    signals.clear_pause();
    signals.set_receiving(true);
    tokio::spawn(run_receiver(channel, pipeline, signals, recv_timeout))
}

async fn run_receiver(
    channel: Arc<DataChannel>,
    mut pipeline: BufferPipeline,
    signals: Arc<ReceiverSignals>,
    recv_timeout: Duration,
) -> ReceiverExit {
    info!("Receiver started on {}", channel.local_addr());
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut packets = 0u64;

    let reason = loop {
        if let Some(reason) = signals.exit_reason() {
            break reason;
        }

        let received = tokio::select! {
            _ = signals.wake.notified() => continue,
            received = tokio::time::timeout(recv_timeout, channel.socket.recv(&mut buf)) => received,
        };
        match received {
            Ok(Ok(len)) => match RtpPacket::decode(&buf[..len]) {
                Ok(packet) => {
                    packets += 1;
                    if signals.observe_sequence(packet.header.sequence) {
                        trace!("New highest sequence {}", packet.header.sequence);
                    }
                    pipeline.append(packet.payload);
                }
                Err(e) => debug!("Dropping datagram of {} bytes: {}", len, e),
            },
            Ok(Err(e)) => {
                if signals.is_torn_down() {
                    break ExitReason::TornDown;
                }
                warn!("Data channel receive failed: {}", e);
                break ExitReason::TransportFailed;
            }
            Err(_elapsed) => {}
        }
    };

    signals.set_receiving(false);
    info!(
        "Receiver stopped ({}), {} packets, highest sequence {}",
        reason,
        packets,
        signals.highest_sequence()
    );
    ReceiverExit {
        pipeline,
        reason,
        packets,
    }
}
