//! Error types for the music engine and its boundaries

use thiserror::Error;

use crate::track::TrackId;

/// Errors reported by a [`PlaybackDevice`](crate::device::PlaybackDevice).
///
/// Every device call returns one of these instead of leaving an error flag
/// behind for a later check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No audio output device available")]
    NoDevice,

    #[error("Failed to configure audio output: {0}")]
    Config(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Out of {0}")]
    OutOfResources(&'static str),

    #[error("Invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u32 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Voice queue is full ({needed} samples needed, {available} free)")]
    QueueFull { needed: usize, available: usize },
}

/// Result type for device calls
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors raised while opening or reading a compressed track.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vorbis error: {0}")]
    Vorbis(#[from] lewton::VorbisError),

    #[error("Unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("Unsupported channel count: {0} (expected mono or stereo)")]
    UnsupportedChannels(u8),

    #[error("Unsupported sample rate: {0} Hz (minimum {min} Hz)", min = crate::device::MIN_SAMPLE_RATE)]
    UnsupportedRate(u32),
}

/// Errors surfaced by [`MusicEngine`](crate::music::MusicEngine).
#[derive(Error, Debug)]
pub enum MusicError {
    /// Voice or buffer allocation failed while constructing the engine
    #[error("Failed to initialise music engine: {0}")]
    Init(#[source] DeviceError),

    /// The initial chunks could not be decoded in `play()`
    #[error("Failed to start music stream: {0}")]
    Stream(String),

    /// The track could not be opened or its header parsed
    #[error("Failed to open track {track}: {source}")]
    Open {
        track: TrackId,
        #[source]
        source: DecodeError,
    },

    /// A device call failed outside the per-tick path
    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),
}

/// Errors from loading or validating a [`MusicConfig`](crate::config::MusicConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Write(#[source] std::io::Error),

    #[error("Invalid chunk size {0} (must be a non-zero multiple of 4)")]
    ChunkSize(usize),

    #[error("Track name must not be empty")]
    EmptyTrackName,

    #[error("Duplicate track name '{0}'")]
    DuplicateTrack(String),

    #[error("Invalid loop start {seconds} for track '{name}'")]
    LoopStart { name: String, seconds: f64 },

    #[error("Too many tracks: {0} (at most {max})", max = crate::track::MAX_TRACKS)]
    TooManyTracks(usize),
}
