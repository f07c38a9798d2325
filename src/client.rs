//! Streaming client module
//!
//! - `coordinator`: the task that owns the session and applies side effects
//! - `handle`: non-blocking command handle for the front-end
//! - `events`: commands, events, errors and the shared snapshot

mod coordinator;
pub mod events;
mod handle;

pub use coordinator::spawn_client;
pub use events::{
    ClientCommand, ClientError, ClientEvent, ClientEventReceiver, ClientSnapshot,
    SharedClientState,
};
pub use handle::{ClientHandle, ClientThreadHandle};
