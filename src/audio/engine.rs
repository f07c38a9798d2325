//! Playback engine contract
//!
//! The playback queue controller drives audio output through this trait.
//! `AudioHandle` implements it on top of the audio thread; tests use a
//! recording fake.

use std::fmt;
use std::path::Path;

/// Errors from issuing a playback command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Audio thread has exited
    Disconnected,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Disconnected => write!(f, "audio thread is not running"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Audio output capability with a one-deep "up next" slot
///
/// End-of-track notifications are delivered out of band as
/// `AudioEvent::TrackEnded`.
pub trait PlaybackEngine: Send + Sync {
    /// Prepare a file for `play_immediately`
    fn load(&self, path: &Path) -> Result<(), EngineError>;

    /// Replace whatever is playing with the loaded file
    fn play_immediately(&self) -> Result<(), EngineError>;

    /// Put a file in the slot after the current track
    fn queue_next(&self, path: &Path) -> Result<(), EngineError>;

    fn pause(&self);

    fn resume(&self);

    /// Stop playback and drop anything queued
    fn stop(&self);

    /// Whether a track is currently audible
    fn is_busy(&self) -> bool;

    /// Periodic nudge from the idle poll
    fn tick(&self) {}
}
