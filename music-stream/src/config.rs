//! Configuration management (music.toml)
//!
//! Handles loading, saving, and validating the music engine settings and the
//! track table. Settings are stored in TOML format, either at an explicit
//! path or in the platform-specific config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::track::MAX_TRACKS;

/// Name of the config file inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "music.toml";

/// Music engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MusicConfig {
    /// Streaming settings
    #[serde(default)]
    pub stream: StreamConfig,
    /// Output device settings
    #[serde(default)]
    pub device: DeviceConfig,
    /// Base directory for relative track paths
    #[serde(default)]
    pub music_dir: Option<PathBuf>,
    /// Logical tracks, in table order
    #[serde(default)]
    pub tracks: Vec<TrackEntry>,
}

/// Streaming configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Size of one decoded chunk in bytes (default: 32768)
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Gain applied to the voice after construction (default: 1.0)
    #[serde(default = "default_volume")]
    pub initial_volume: f32,
}

/// Output device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of voices the software mixer provides (default: 8)
    #[serde(default = "default_max_voices")]
    pub max_voices: usize,
    /// Per-voice queue length in milliseconds of output audio (default: 1000)
    #[serde(default = "default_queue_capacity_ms")]
    pub queue_capacity_ms: u32,
}

/// One entry of the track table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    /// Logical name used by callers (e.g. "title", "boss")
    pub name: String,
    /// Path to the Ogg Vorbis file, relative to `music_dir` unless absolute
    pub path: PathBuf,
    /// Loop point in seconds (default: 0.0)
    #[serde(default)]
    pub loop_start: f64,
}

fn default_chunk_bytes() -> usize {
    32 * 1024
}
fn default_volume() -> f32 {
    1.0
}
fn default_max_voices() -> usize {
    8
}
fn default_queue_capacity_ms() -> u32 {
    1000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: default_chunk_bytes(),
            initial_volume: default_volume(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_voices: default_max_voices(),
            queue_capacity_ms: default_queue_capacity_ms(),
        }
    }
}

impl MusicConfig {
    /// Parse and validate a config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.stream.chunk_bytes;
        if chunk == 0 || chunk % 4 != 0 {
            return Err(ConfigError::ChunkSize(chunk));
        }
        if self.tracks.len() > MAX_TRACKS {
            return Err(ConfigError::TooManyTracks(self.tracks.len()));
        }

        let mut seen = hashbrown::HashSet::new();
        for entry in &self.tracks {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::EmptyTrackName);
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::DuplicateTrack(entry.name.clone()));
            }
            if !entry.loop_start.is_finite() || entry.loop_start < 0.0 {
                return Err(ConfigError::LoopStart {
                    name: entry.name.clone(),
                    seconds: entry.loop_start,
                });
            }
        }
        Ok(())
    }
}

/// Returns the platform-specific configuration directory.
///
/// Returns `None` if the home directory cannot be determined.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.nethercore", "", "MusicStream")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Loads and validates the configuration at `path`.
pub fn load(path: &Path) -> Result<MusicConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    MusicConfig::from_toml(&content)
}

/// Loads the configuration from the platform config directory.
///
/// Returns default values if the file doesn't exist or cannot be parsed.
pub fn load_default() -> MusicConfig {
    let Some(path) = config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)) else {
        return MusicConfig::default();
    };
    if !path.exists() {
        return MusicConfig::default();
    }
    match load(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
            MusicConfig::default()
        }
    }
}

/// Saves the configuration to `path`, creating parent directories.
pub fn save(config: &MusicConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(ConfigError::Write)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(ConfigError::Write)
}
