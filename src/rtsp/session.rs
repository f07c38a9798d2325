//! Control-session state machine
//!
//! Pure bookkeeping: no I/O happens here. The coordinator asks for a
//! `Request` to send and hands back each parsed `Reply`; the returned
//! `ReplyOutcome` tells it which side effects to apply.
//!
//! ```text
//!          SETUP ok          PLAY ok
//!   Init ----------> Ready ----------> Playing
//!     ^                ^                  |
//!     |                +------------------+
//!     |                      PAUSE ok
//!     +---- TEARDOWN ok (from Ready or Playing)
//! ```

use std::fmt;

use super::message::{Reply, Request, RequestKind};

// ============ State ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Init,
    Ready,
    Playing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Playing => write!(f, "PLAYING"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Command not allowed in the current state; nothing was sent
    WrongState {
        request: RequestKind,
        state: SessionState,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::WrongState { request, state } => {
                write!(f, "{} is not allowed in state {}", request, state)
            }
        }
    }
}

impl std::error::Error for SessionError {}

// ============ Reply outcomes ============

/// Side effect the coordinator must apply after an accepted reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// SETUP confirmed: open the data channel
    Ready,
    /// PLAY confirmed
    Playing,
    /// PAUSE confirmed: stop the receiver, keep its socket
    Paused,
    /// TEARDOWN confirmed: stop everything, reclaim storage
    TornDown,
}

/// How a reply was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// CSeq does not match the outstanding request
    Stale { expected: u32, got: u32 },
    /// Session id differs from the adopted one
    ForeignSession { expected: u64, got: u64 },
    /// Nothing was outstanding
    Unsolicited,
    /// Non-200 status; state unchanged
    Rejected {
        request: RequestKind,
        status: u16,
        reason: String,
    },
    Accepted(Transition),
}

// ============ Session ============

#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    cseq: u32,
    /// Zero until the first reply carrying an id
    session_id: u64,
    pending: Option<RequestKind>,
    teardown_acknowledged: bool,
    resource: String,
    client_port: u16,
}

impl Session {
    pub fn new(resource: impl Into<String>, client_port: u16) -> Self {
        Self {
            state: SessionState::Init,
            cseq: 0,
            session_id: 0,
            pending: None,
            teardown_acknowledged: false,
            resource: resource.into(),
            client_port,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sequence number of the last issued request
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn pending(&self) -> Option<RequestKind> {
        self.pending
    }

    pub fn is_teardown_acknowledged(&self) -> bool {
        self.teardown_acknowledged
    }

    pub fn allows(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Setup => self.state == SessionState::Init,
            RequestKind::Play => self.state == SessionState::Ready,
            RequestKind::Pause => self.state == SessionState::Playing,
            RequestKind::Teardown => self.state != SessionState::Init,
        }
    }

    /// Issue a request, consuming a sequence number
    pub fn request(&mut self, kind: RequestKind) -> Result<Request, SessionError> {
        if !self.allows(kind) {
            return Err(SessionError::WrongState {
                request: kind,
                state: self.state,
            });
        }

        self.cseq += 1;
        self.pending = Some(kind);
        if kind == RequestKind::Setup {
            self.teardown_acknowledged = false;
        }

        Ok(Request {
            kind,
            resource: self.resource.clone(),
            cseq: self.cseq,
            client_port: self.client_port,
            session_id: self.session_id,
        })
    }

    /// Validate a reply against the outstanding request and apply it
    pub fn on_reply(&mut self, reply: &Reply) -> ReplyOutcome {
        if reply.cseq != self.cseq {
            return ReplyOutcome::Stale {
                expected: self.cseq,
                got: reply.cseq,
            };
        }
        let Some(request) = self.pending else {
            return ReplyOutcome::Unsolicited;
        };

        if let Some(id) = reply.session_id {
            if self.session_id == 0 {
                self.session_id = id;
            } else if id != self.session_id {
                return ReplyOutcome::ForeignSession {
                    expected: self.session_id,
                    got: id,
                };
            }
        }

        self.pending = None;
        if !reply.is_success() {
            return ReplyOutcome::Rejected {
                request,
                status: reply.status,
                reason: reply.reason.clone(),
            };
        }

        let transition = match request {
            RequestKind::Setup => {
                self.state = SessionState::Ready;
                Transition::Ready
            }
            RequestKind::Play => {
                self.state = SessionState::Playing;
                Transition::Playing
            }
            RequestKind::Pause => {
                self.state = SessionState::Ready;
                Transition::Paused
            }
            RequestKind::Teardown => {
                self.state = SessionState::Init;
                self.teardown_acknowledged = true;
                Transition::TornDown
            }
        };
        ReplyOutcome::Accepted(transition)
    }
}
