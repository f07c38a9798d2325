//! Audio thread communication types
//!
//! - `AudioCommand` - Commands sent to the audio thread
//! - `AudioEvent` - Events sent back by the audio thread
//! - `SharedPlaybackState` - Thread-safe state for non-blocking reads
//!
//! ## Architecture
//! ```text
//! Coordinator (AudioHandle) --[AudioCommand]--> Audio Thread (AudioPlayer)
//! Coordinator              <--[AudioEvent]---- Audio Thread
//! Coordinator              <--[SharedState]--- Audio Thread (non-blocking reads)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::player::PlaybackStatus;

// ============ Commands (Coordinator -> Audio Thread) ============

/// Commands sent to the audio thread
///
/// All commands are processed asynchronously; results come back as `AudioEvent`s.
#[derive(Debug, Clone)]
pub enum AudioCommand {
    /// Decode a file and hold it for `PlayImmediately`
    Load { path: PathBuf },
    /// Replace the sink contents with the loaded file
    PlayImmediately,
    /// Append a file after whatever is playing
    QueueNext { path: PathBuf },
    Pause,
    Resume,
    /// Stop playback and drop queued files
    Stop,
    /// Set volume (0.0 - 1.0)
    SetVolume { volume: f32 },
    /// Periodic check for finished tracks
    Tick,
}

impl AudioCommand {
    /// Commands that make the player busy once processed
    pub fn starts_playback(&self) -> bool {
        matches!(
            self,
            AudioCommand::PlayImmediately | AudioCommand::QueueNext { .. }
        )
    }
}

// ============ Events (Audio Thread -> Coordinator) ============

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// A track became the audible one
    Started { path: PathBuf },
    /// A track played to its end
    TrackEnded { path: PathBuf },
    Paused,
    Resumed,
    Stopped,
    Error { message: String },
}

// ============ Shared State ============

#[derive(Debug, Clone)]
struct PlaybackStateInner {
    status: PlaybackStatus,
    current_path: Option<PathBuf>,
    /// Tracks in the sink, including the audible one
    queued: usize,
    volume: f32,
}

impl Default for PlaybackStateInner {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Stopped,
            current_path: None,
            queued: 0,
            volume: 1.0,
        }
    }
}

/// Thread-safe shared playback state
///
/// The coordinator reads this without blocking; the audio thread updates it
/// after each command.
#[derive(Clone, Default)]
pub struct SharedPlaybackState {
    inner: Arc<RwLock<PlaybackStateInner>>,
    /// Playback commands sent but not yet processed by the audio thread
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for SharedPlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SharedPlaybackState")
            .field("status", &inner.status)
            .field("current_path", &inner.current_path)
            .field("queued", &inner.queued)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl SharedPlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.inner.read().status
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.read().current_path.clone()
    }

    pub fn queued(&self) -> usize {
        self.inner.read().queued
    }

    pub fn volume(&self) -> f32 {
        self.inner.read().volume
    }

    /// Audible, or about to be once pending commands are processed
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
            || self.inner.read().status == PlaybackStatus::Playing
    }

    // ---- Called by AudioHandle ----

    pub(super) fn begin_command(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    // ---- Called by audio thread ----

    pub(super) fn finish_command(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(super) fn update(&self, status: PlaybackStatus, current_path: Option<PathBuf>, queued: usize) {
        let mut inner = self.inner.write();
        inner.status = status;
        inner.current_path = current_path;
        inner.queued = queued;
    }

    pub(super) fn set_volume(&self, volume: f32) {
        self.inner.write().volume = volume;
    }
}

// ============ Channel Types ============

/// Sender for audio commands (held by AudioHandle)
pub type AudioCommandSender = tokio::sync::mpsc::UnboundedSender<AudioCommand>;

/// Receiver for audio commands (held by audio thread)
pub type AudioCommandReceiver = tokio::sync::mpsc::UnboundedReceiver<AudioCommand>;

/// Sender for audio events (held by audio thread)
pub type AudioEventSender = tokio::sync::mpsc::UnboundedSender<AudioEvent>;

/// Receiver for audio events (held by the coordinator)
pub type AudioEventReceiver = tokio::sync::mpsc::UnboundedReceiver<AudioEvent>;

pub fn audio_command_channel() -> (AudioCommandSender, AudioCommandReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

pub fn audio_event_channel() -> (AudioEventSender, AudioEventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_commands_count_as_busy() {
        let state = SharedPlaybackState::new();
        assert!(!state.is_busy());

        state.begin_command();
        assert!(state.is_busy());
        state.finish_command();
        assert!(!state.is_busy());

        // Never underflows
        state.finish_command();
        assert!(!state.is_busy());
    }

    #[test]
    fn test_update_reflects_player() {
        let state = SharedPlaybackState::new();
        state.update(PlaybackStatus::Playing, Some(PathBuf::from("a.mp3")), 2);
        assert!(state.is_busy());
        assert_eq!(state.queued(), 2);
        assert_eq!(state.current_path(), Some(PathBuf::from("a.mp3")));

        state.update(PlaybackStatus::Paused, Some(PathBuf::from("a.mp3")), 2);
        assert!(!state.is_busy());
    }
}
