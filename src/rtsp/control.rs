//! Control channel
//!
//! One TCP connection per session. The write half stays with the
//! coordinator; the read half is consumed by a reply listener task that
//! forwards parsed replies in arrival order.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::message::{Reply, ReplyReader, Request};

const READ_BUFFER_SIZE: usize = 1024;

// ============ Errors ============

#[derive(Debug)]
pub enum ControlError {
    /// Could not reach the server
    Connect { addr: String, source: io::Error },
    /// Writing a request failed
    Send(io::Error),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Connect { addr, source } => {
                write!(f, "Connection to {} failed: {}", addr, source)
            }
            ControlError::Send(e) => write!(f, "Failed to send request: {}", e),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Connect { source, .. } => Some(source),
            ControlError::Send(e) => Some(e),
        }
    }
}

// ============ Events ============

/// What the reply listener reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Reply(Reply),
    /// Text that could not be parsed as a reply
    Malformed(String),
    /// Peer closed the connection or the read failed
    Closed,
}

pub type ControlEventSender = mpsc::UnboundedSender<ControlEvent>;
pub type ControlEventReceiver = mpsc::UnboundedReceiver<ControlEvent>;

pub fn control_event_channel() -> (ControlEventSender, ControlEventReceiver) {
    mpsc::unbounded_channel()
}

// ============ Channel ============

#[derive(Debug)]
pub struct ControlChannel {
    writer: OwnedWriteHalf,
    listener: JoinHandle<()>,
    peer: SocketAddr,
}

impl ControlChannel {
    /// Connect and start the reply listener
    pub async fn connect(addr: &str, events: ControlEventSender) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ControlError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let peer = stream.peer_addr().map_err(|source| ControlError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let (reader, writer) = stream.into_split();
        let listener = tokio::spawn(listen_for_replies(reader, events));

        info!("Control channel connected to {}", peer);
        Ok(Self {
            writer,
            listener,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ControlError> {
        let text = request.render();
        debug!("-> {:?}", text);
        self.writer
            .write_all(text.as_bytes())
            .await
            .map_err(ControlError::Send)?;
        self.writer.flush().await.map_err(ControlError::Send)
    }

    /// Shut down the write half and stop the listener
    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Control channel shutdown: {}", e);
        }
        self.listener.abort();
        info!("Control channel to {} closed", self.peer);
    }
}

async fn listen_for_replies(mut reader: OwnedReadHalf, events: ControlEventSender) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut replies = ReplyReader::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Control channel read failed: {}", e);
                break;
            }
        };

        let text = String::from_utf8_lossy(&buf[..n]);
        debug!("<- {:?}", text);
        for parsed in replies.push(&text) {
            if events.send(to_event(parsed)).is_err() {
                return;
            }
        }
    }

    if let Some(parsed) = replies.finish() {
        let _ = events.send(to_event(parsed));
    }
    let _ = events.send(ControlEvent::Closed);
}

fn to_event(parsed: Result<Reply, super::message::ReplyParseError>) -> ControlEvent {
    match parsed {
        Ok(reply) => ControlEvent::Reply(reply),
        Err(e) => ControlEvent::Malformed(e.to_string()),
    }
}
