//! Logical track identifiers and the track-name table

use std::fmt;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::config::MusicConfig;
use crate::device::SampleFormat;
use crate::error::{ConfigError, DecodeError};

/// Tracks one table can hold; every [`TrackId`] index fits in a `u16`
pub const MAX_TRACKS: usize = u16::MAX as usize + 1;

/// Opaque key for a logical music track.
///
/// Issued by a [`TrackTable`]; the raw index is only meaningful to the table
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u16);

impl TrackId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stream header metadata, read once per track load.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub channels: u8,
    pub sample_rate: u32,
    pub format: SampleFormat,
    /// Encoder vendor string from the comment header
    pub vendor: String,
    /// User comments (`TITLE`, `ARTIST`, `LOOPSTART`, ...)
    pub comments: Vec<(String, String)>,
}

impl TrackInfo {
    /// First comment value for `key`, compared case-insensitively.
    pub fn comment(&self, key: &str) -> Option<&str> {
        self.comments
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Bytes of 16-bit PCM per second of audio
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.format.frame_bytes()
    }
}

#[derive(Debug, Clone)]
struct TrackSlot {
    name: String,
    path: PathBuf,
    loop_start: f64,
}

/// Maps logical track identifiers to names, files, and loop points.
#[derive(Debug, Clone, Default)]
pub struct TrackTable {
    slots: Vec<TrackSlot>,
    by_name: HashMap<String, TrackId>,
}

impl TrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from the `[[tracks]]` section, resolving relative
    /// paths against `music_dir`.
    pub fn from_config(config: &MusicConfig) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for entry in &config.tracks {
            let path = match &config.music_dir {
                Some(dir) if entry.path.is_relative() => dir.join(&entry.path),
                _ => entry.path.clone(),
            };
            table.insert(&entry.name, path, entry.loop_start)?;
        }
        Ok(table)
    }

    /// Add a track, or replace the file and loop point of an existing name.
    ///
    /// Fails once the table holds [`MAX_TRACKS`] names.
    pub fn insert(
        &mut self,
        name: &str,
        path: impl Into<PathBuf>,
        loop_start: f64,
    ) -> Result<TrackId, ConfigError> {
        let slot = TrackSlot {
            name: name.to_string(),
            path: path.into(),
            loop_start,
        };
        if let Some(&id) = self.by_name.get(name) {
            self.slots[id.index()] = slot;
            return Ok(id);
        }
        let index = u16::try_from(self.slots.len())
            .map_err(|_| ConfigError::TooManyTracks(self.slots.len() + 1))?;
        let id = TrackId::new(index);
        self.slots.push(slot);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<TrackId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: TrackId) -> Option<&str> {
        self.slots.get(id.index()).map(|s| s.name.as_str())
    }

    /// File backing `id`.
    pub fn path(&self, id: TrackId) -> Result<&Path, DecodeError> {
        self.slots
            .get(id.index())
            .map(|s| s.path.as_path())
            .ok_or(DecodeError::UnknownTrack(id))
    }

    pub fn loop_start(&self, id: TrackId) -> Option<f64> {
        self.slots.get(id.index()).map(|s| s.loop_start)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate `(id, name, path)` in table order.
    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &str, &Path)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (TrackId::new(i as u16), s.name.as_str(), s.path.as_path()))
    }
}
