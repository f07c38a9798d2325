//! Control protocol module
//!
//! - `message`: request rendering and reply parsing/framing
//! - `session`: the pure session state machine
//! - `control`: TCP control channel with its reply listener task

pub mod control;
pub mod message;
pub mod session;

pub use control::{
    ControlChannel, ControlError, ControlEvent, ControlEventReceiver, ControlEventSender,
    control_event_channel,
};
pub use message::{Reply, ReplyParseError, Request, RequestKind};
pub use session::{ReplyOutcome, Session, SessionError, SessionState, Transition};
