//! Decode context boundary
//!
//! A [`TrackLoader`] opens logical tracks; each open yields a
//! [`TrackDecoder`], a stateful cursor producing interleaved 16-bit PCM.
//! Dropping the decoder closes the underlying stream.

mod vorbis;

pub use vorbis::{VorbisDecoder, VorbisLibrary};

use crate::error::DecodeError;
use crate::track::{TrackId, TrackInfo};

/// Sequential reader over one open compressed track.
pub trait TrackDecoder: Send {
    /// Header metadata, fixed for the life of the decoder
    fn info(&self) -> &TrackInfo;

    /// Fill `out` with interleaved signed 16-bit little-endian PCM.
    ///
    /// Returns the number of bytes written, which may be less than
    /// `out.len()`. `Ok(0)` means end of stream.
    fn read(&mut self, out: &mut [u8]) -> Result<usize, DecodeError>;

    /// Reposition to an absolute time in seconds.
    fn seek(&mut self, seconds: f64) -> Result<(), DecodeError>;
}

/// Opens decoders for logical tracks.
pub trait TrackLoader: Send + Sync {
    type Decoder: TrackDecoder;

    fn open(&self, track: TrackId) -> Result<Self::Decoder, DecodeError>;

    /// Human-readable track name for logs
    fn describe(&self, track: TrackId) -> String {
        track.to_string()
    }
}
