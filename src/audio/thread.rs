//! Audio thread implementation
//!
//! The rodio output stream is bound to the thread that opened it, so the
//! `AudioPlayer` lives on a dedicated thread that processes commands from
//! the coordinator and sends events back.

use std::thread;

use super::events::{
    AudioCommand, AudioCommandReceiver, AudioEvent, AudioEventReceiver, AudioEventSender,
    SharedPlaybackState, audio_command_channel, audio_event_channel,
};
use super::handle::AudioHandle;
use super::player::AudioPlayer;

pub struct AudioThreadHandle {
    pub handle: AudioHandle,
    pub event_rx: Option<AudioEventReceiver>,
}

impl AudioThreadHandle {
    pub fn take_event_rx(&mut self) -> Option<AudioEventReceiver> {
        self.event_rx.take()
    }
}

/// Spawn the audio thread
///
/// The player is created inside the thread; if opening the output fails the
/// error is reported as an `AudioEvent::Error` and later commands fail with
/// `EngineError::Disconnected`. The thread exits once every handle is gone.
pub fn spawn_audio_thread(
    device_name: Option<&str>,
    volume: f32,
) -> Result<AudioThreadHandle, String> {
    let (command_tx, command_rx) = audio_command_channel();
    let (event_tx, event_rx) = audio_event_channel();

    let state = SharedPlaybackState::new();
    let state_clone = state.clone();
    let handle = AudioHandle::new(command_tx, state);

    let device_name_owned = device_name.map(|s| s.to_string());

    thread::Builder::new()
        .name("audio-player".to_string())
        .spawn(move || {
            match AudioPlayer::with_device(device_name_owned.as_deref(), volume) {
                Ok(player) => audio_thread_main(player, command_rx, event_tx, state_clone),
                Err(e) => {
                    tracing::error!("Failed to create audio player: {}", e);
                    let _ = event_tx.send(AudioEvent::Error { message: e });
                }
            }
        })
        .map_err(|e| format!("Failed to spawn audio thread: {}", e))?;

    Ok(AudioThreadHandle {
        handle,
        event_rx: Some(event_rx),
    })
}

/// Main loop for the audio thread
///
/// Blocks on `command_rx.blocking_recv()` until every sender is gone.
fn audio_thread_main(
    mut player: AudioPlayer,
    mut command_rx: AudioCommandReceiver,
    event_tx: AudioEventSender,
    state: SharedPlaybackState,
) {
    tracing::info!("Audio thread started");
    state.set_volume(player.volume());

    while let Some(cmd) = command_rx.blocking_recv() {
        // Tracks that ran out before this command touches the sink
        report_finished(&mut player, &event_tx);

        let tracked = cmd.starts_playback();
        match cmd {
            AudioCommand::Load { path } => {
                if let Err(e) = player.load(path) {
                    tracing::warn!("{}", e);
                    let _ = event_tx.send(AudioEvent::Error { message: e });
                }
            }

            AudioCommand::PlayImmediately => match player.play_immediately() {
                Ok(path) => {
                    tracing::debug!("Playing {:?}", path);
                    let _ = event_tx.send(AudioEvent::Started { path });
                }
                Err(e) => {
                    tracing::warn!("Play failed: {}", e);
                    let _ = event_tx.send(AudioEvent::Error { message: e });
                }
            },

            AudioCommand::QueueNext { path } => {
                let was_idle = player.queued() == 0;
                match player.queue_next(path.clone()) {
                    Ok(()) if was_idle => {
                        let _ = event_tx.send(AudioEvent::Started { path });
                    }
                    Ok(()) => tracing::debug!("Queued {:?}", path),
                    Err(e) => {
                        tracing::warn!("Queue failed: {}", e);
                        let _ = event_tx.send(AudioEvent::Error { message: e });
                    }
                }
            }

            AudioCommand::Pause => {
                player.pause();
                let _ = event_tx.send(AudioEvent::Paused);
            }

            AudioCommand::Resume => {
                player.resume();
                let _ = event_tx.send(AudioEvent::Resumed);
            }

            AudioCommand::Stop => {
                player.stop();
                let _ = event_tx.send(AudioEvent::Stopped);
            }

            AudioCommand::SetVolume { volume } => {
                player.set_volume(volume);
                state.set_volume(player.volume());
            }

            AudioCommand::Tick => {}
        }

        if tracked {
            state.finish_command();
        }
        state.update(
            player.status(),
            player.current_path().cloned(),
            player.queued(),
        );
    }

    tracing::info!("Audio thread exiting (command channel closed)");
}

fn report_finished(player: &mut AudioPlayer, event_tx: &AudioEventSender) {
    for path in player.take_finished() {
        tracing::debug!("Track ended: {:?}", path);
        let _ = event_tx.send(AudioEvent::TrackEnded { path });
    }
}
