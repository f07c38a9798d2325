//! Audio handle for non-blocking audio control
//!
//! `AudioHandle` sends commands to the audio thread and returns immediately.
//! State is read from `SharedPlaybackState` without blocking.

use std::path::{Path, PathBuf};

use super::engine::{EngineError, PlaybackEngine};
use super::events::{AudioCommand, AudioCommandSender, SharedPlaybackState};

/// Handle for controlling the audio thread
///
/// Play and queue commands mark the handle busy before they are sent, so an
/// idle poll that runs before the audio thread catches up does not start a
/// second track.
#[derive(Clone)]
pub struct AudioHandle {
    command_tx: AudioCommandSender,
    state: SharedPlaybackState,
}

impl std::fmt::Debug for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandle")
            .field("state", &self.state)
            .finish()
    }
}

impl AudioHandle {
    pub fn new(command_tx: AudioCommandSender, state: SharedPlaybackState) -> Self {
        Self { command_tx, state }
    }

    fn send(&self, command: AudioCommand) -> Result<(), EngineError> {
        let tracked = command.starts_playback();
        if tracked {
            self.state.begin_command();
        }
        self.command_tx.send(command).map_err(|_| {
            if tracked {
                self.state.finish_command();
            }
            EngineError::Disconnected
        })
    }

    pub fn set_volume(&self, volume: f32) {
        let _ = self.command_tx.send(AudioCommand::SetVolume { volume });
    }

    pub fn state(&self) -> &SharedPlaybackState {
        &self.state
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.current_path()
    }
}

impl PlaybackEngine for AudioHandle {
    fn load(&self, path: &Path) -> Result<(), EngineError> {
        self.send(AudioCommand::Load {
            path: path.to_path_buf(),
        })
    }

    fn play_immediately(&self) -> Result<(), EngineError> {
        self.send(AudioCommand::PlayImmediately)
    }

    fn queue_next(&self, path: &Path) -> Result<(), EngineError> {
        self.send(AudioCommand::QueueNext {
            path: path.to_path_buf(),
        })
    }

    fn pause(&self) {
        let _ = self.command_tx.send(AudioCommand::Pause);
    }

    fn resume(&self) {
        let _ = self.command_tx.send(AudioCommand::Resume);
    }

    fn stop(&self) {
        let _ = self.command_tx.send(AudioCommand::Stop);
    }

    fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    fn tick(&self) {
        let _ = self.command_tx.send(AudioCommand::Tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::audio_command_channel;

    #[test]
    fn test_play_commands_mark_busy_until_processed() {
        let (tx, mut rx) = audio_command_channel();
        let handle = AudioHandle::new(tx, SharedPlaybackState::new());

        handle.load(Path::new("cache-1-0.mp3")).unwrap();
        assert!(!handle.is_busy());
        handle.play_immediately().unwrap();
        assert!(handle.is_busy());

        assert!(matches!(rx.try_recv(), Ok(AudioCommand::Load { .. })));
        assert!(matches!(rx.try_recv(), Ok(AudioCommand::PlayImmediately)));
        handle.state().finish_command();
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_disconnected_thread_is_an_error() {
        let (tx, rx) = audio_command_channel();
        drop(rx);
        let handle = AudioHandle::new(tx, SharedPlaybackState::new());

        assert_eq!(
            handle.queue_next(Path::new("x.mp3")),
            Err(EngineError::Disconnected)
        );
        assert!(!handle.is_busy());
        // Fire-and-forget commands do not panic
        handle.pause();
        handle.tick();
    }
}
