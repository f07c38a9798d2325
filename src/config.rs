//! Client settings persistence
//!
//! Settings are stored as pretty JSON in the platform config directory.
//! A missing or unreadable file yields defaults; command-line arguments are
//! applied on top by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_SEGMENT_BYTES;
use crate::rtp::DEFAULT_RECV_TIMEOUT;

/// Default cache root used when no directory is configured
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rtsp-audio-client")
        .join("segments")
}

/// Client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_host: String,
    pub server_port: u16,
    /// Local port the server streams datagrams to
    pub rtp_port: u16,
    /// Resource name requested in SETUP
    pub resource: String,
    /// Bytes per cached segment
    pub segment_threshold_bytes: usize,
    /// Bound on one datagram receive
    pub receive_timeout_ms: u64,
    /// Idle-poll interval of the playback queue
    pub idle_poll_ms: u64,
    /// Where segments are written; `None` uses `default_cache_dir()`
    pub cache_dir: Option<PathBuf>,
    /// Output device name; `None` uses the system default
    pub audio_output_device: Option<String>,
    /// Volume level (0.0 to 1.0)
    pub volume: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 554,
            rtp_port: 25000,
            resource: String::new(),
            segment_threshold_bytes: DEFAULT_SEGMENT_BYTES,
            receive_timeout_ms: DEFAULT_RECV_TIMEOUT.as_millis() as u64,
            idle_poll_ms: 100,
            cache_dir: None,
            audio_output_device: None,
            volume: 1.0,
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "rtsp-audio-client", "RtspAudioClient")
            .map(|dirs| dirs.config_dir().join("settings.json"))
    }

    /// Load settings from file, or return defaults if not found
    pub fn load() -> Self {
        Self::file_path()
            .and_then(|path| Self::load_from_file(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Save settings to the default file
    pub fn save(&self) -> Result<(), SettingsError> {
        if let Some(path) = Self::file_path() {
            self.save_to_file(&path)
        } else {
            Err(SettingsError::Io(
                "Could not determine config directory".to_string(),
            ))
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| SettingsError::Io(e.to_string()))?;
        Ok(())
    }

    /// `host:port` of the control server
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }
}

/// Errors that can occur with settings
#[derive(Debug, Clone)]
pub enum SettingsError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "IO error: {}", e),
            SettingsError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}
