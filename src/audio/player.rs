//! Audio player using rodio
//!
//! One `Sink` holds the audible segment followed by at most a few queued
//! ones. rodio gives no end-of-source callback, so the player remembers
//! which paths it appended and compares that list with `Sink::len()` to
//! find out how many have finished.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};

/// Playback status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Stopped,
    Playing,
    Paused,
}

type FileSource = Decoder<BufReader<File>>;

/// Audio player over a single sink
pub struct AudioPlayer {
    _stream: OutputStream,
    sink: Sink,
    /// Decoded by `load`, consumed by `play_immediately`
    loaded: Option<(PathBuf, FileSource)>,
    /// Paths appended to the sink, audible one first
    tracks: VecDeque<PathBuf>,
    volume: f32,
}

impl AudioPlayer {
    /// Create a player on the named device, or the default one
    pub fn with_device(device_name: Option<&str>, volume: f32) -> Result<Self, String> {
        let stream = match device_name {
            Some(name) => Self::create_stream_for_device(name)?,
            None => OutputStreamBuilder::open_default_stream()
                .map_err(|e| format!("Failed to create audio output: {}", e))?,
        };
        let volume = volume.clamp(0.0, 1.0);
        let sink = Sink::connect_new(stream.mixer());
        sink.set_volume(volume);

        Ok(Self {
            _stream: stream,
            sink,
            loaded: None,
            tracks: VecDeque::new(),
            volume,
        })
    }

    /// Create output stream for a specific device by name
    fn create_stream_for_device(device_name: &str) -> Result<OutputStream, String> {
        let host = rodio::cpal::default_host();

        let device = host
            .output_devices()
            .map_err(|e| format!("Failed to enumerate devices: {}", e))?
            .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
            .ok_or_else(|| format!("Device not found: {}", device_name))?;

        let config = device
            .default_output_config()
            .map_err(|e| format!("Failed to get device config: {}", e))?;

        OutputStreamBuilder::from_device(device)
            .map_err(|e| format!("Failed to create stream builder: {}", e))?
            .with_sample_rate(config.sample_rate().0)
            .open_stream()
            .map_err(|e| format!("Failed to open stream: {}", e))
    }

    fn decode(path: &Path) -> Result<FileSource, String> {
        let file = File::open(path).map_err(|e| format!("Failed to open {:?}: {}", path, e))?;
        Decoder::new(BufReader::new(file))
            .map_err(|e| format!("Failed to decode {:?}: {}", path, e))
    }

    /// Decode a file so `play_immediately` can start it without delay
    pub fn load(&mut self, path: PathBuf) -> Result<(), String> {
        let source = Self::decode(&path)?;
        self.loaded = Some((path, source));
        Ok(())
    }

    /// Replace whatever is in the sink with the loaded file
    pub fn play_immediately(&mut self) -> Result<PathBuf, String> {
        let (path, source) = self
            .loaded
            .take()
            .ok_or_else(|| "Nothing loaded".to_string())?;

        self.sink.clear();
        self.tracks.clear();
        self.sink.append(source);
        self.sink.play();
        self.tracks.push_back(path.clone());
        Ok(path)
    }

    /// Append a file after the current one; starts it if the sink is empty
    pub fn queue_next(&mut self, path: PathBuf) -> Result<(), String> {
        let source = Self::decode(&path)?;
        self.sink.append(source);
        self.tracks.push_back(path);
        Ok(())
    }

    pub fn pause(&mut self) {
        self.sink.pause();
    }

    pub fn resume(&mut self) {
        if !self.sink.empty() {
            self.sink.play();
        }
    }

    pub fn stop(&mut self) {
        self.sink.clear();
        self.tracks.clear();
        self.loaded = None;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.sink.set_volume(self.volume);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Paths that finished since the last call, in play order
    pub fn take_finished(&mut self) -> Vec<PathBuf> {
        let remaining = self.sink.len();
        let finished = self.tracks.len().saturating_sub(remaining);
        self.tracks.drain(..finished).collect()
    }

    pub fn current_path(&self) -> Option<&PathBuf> {
        self.tracks.front()
    }

    /// Tracks in the sink, including the audible one
    pub fn queued(&self) -> usize {
        self.tracks.len()
    }

    pub fn status(&self) -> PlaybackStatus {
        if self.sink.empty() {
            PlaybackStatus::Stopped
        } else if self.sink.is_paused() {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        }
    }
}

/// Names of the usable output devices
pub fn output_device_names() -> Vec<String> {
    let host = rodio::cpal::default_host();
    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };
    devices
        .filter(|d| d.default_output_config().is_ok())
        .filter_map(|d| d.name().ok())
        .collect()
}
