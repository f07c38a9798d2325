//! Audio playback module
//!
//! - `engine`: the `PlaybackEngine` contract the queue drives
//! - `queue`: ordered segment queue with its engine slot bookkeeping
//! - `events`: commands, events and shared state of the audio thread
//! - `handle`: `AudioHandle`, the non-blocking `PlaybackEngine` implementation
//! - `player` / `thread`: rodio output running on a dedicated thread

pub mod engine;
pub mod events;
mod handle;
mod player;
pub mod queue;
mod thread;

pub use engine::{EngineError, PlaybackEngine};
pub use events::{AudioEvent, AudioEventReceiver, AudioEventSender, audio_event_channel};
pub use handle::AudioHandle;
pub use player::{PlaybackStatus, output_device_names};
pub use queue::PlaybackQueue;
pub use thread::{AudioThreadHandle, spawn_audio_thread};
