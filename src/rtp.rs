//! Data channel module
//!
//! - `packet`: RTP fixed-header codec
//! - `receiver`: per-play-phase datagram receiver task and its signals

pub mod packet;
pub mod receiver;

pub use packet::{PacketError, RtpHeader, RtpPacket};
pub use receiver::{
    DataChannel, ExitReason, ReceiverExit, ReceiverSignals, DEFAULT_RECV_TIMEOUT, spawn_receiver,
};
