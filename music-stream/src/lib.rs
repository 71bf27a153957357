//! Music Stream - Library interface
//!
//! Streams long compressed music tracks through a playback device with a
//! fixed pair of buffers, switches tracks on demand from any thread, loops
//! each track at a configurable offset, and fades out on request.
//!
//! The engine is generic over its two boundaries:
//!
//! - [`device::PlaybackDevice`]: voice/buffer-queue output. [`CpalDevice`]
//!   mixes in software onto the default cpal output.
//! - [`decode::TrackLoader`]: opens logical tracks as PCM decoders.
//!   [`VorbisLibrary`] reads Ogg Vorbis files named by a [`TrackTable`].

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod music;
pub mod track;

#[cfg(test)]
mod test_support;

pub use config::MusicConfig;
pub use decode::VorbisLibrary;
pub use device::CpalDevice;
pub use error::{DecodeError, DeviceError, MusicError};
pub use music::{MusicEngine, TickOutcome};
pub use track::{TrackId, TrackInfo, TrackTable};
