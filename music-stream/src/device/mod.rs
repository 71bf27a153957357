//! Playback device boundary
//!
//! The engine talks to audio hardware through [`PlaybackDevice`], a small
//! voice/buffer-queue API:
//!
//! - A **voice** is a playback channel; buffers are queued on it in order.
//! - A **buffer** holds one decoded chunk of PCM. Once the voice has played
//!   it, the buffer counts as *processed* and can be unqueued, refilled, and
//!   queued again.
//!
//! Every call returns a [`DeviceResult`], so errors are checked at the call
//! site rather than polled afterwards.
//!
//! [`CpalDevice`] is the software implementation used by the player; tests
//! use an instrumented fake.

mod convert;
mod cpal_device;

use std::fmt;

pub use cpal_device::CpalDevice;

use crate::error::DeviceResult;

/// Lowest source sample rate decoders hand to a device
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// Handle to a voice owned by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u32);

/// Handle to a buffer owned by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice {}", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// Layout of PCM submitted with [`PlaybackDevice::buffer_data`].
///
/// Samples are signed 16-bit little-endian, interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Mono16,
    Stereo16,
}

impl SampleFormat {
    /// Format for a decoded stream with `channels` channels
    pub fn from_channels(channels: u8) -> Option<Self> {
        match channels {
            1 => Some(Self::Mono16),
            2 => Some(Self::Stereo16),
            _ => None,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            Self::Mono16 => 1,
            Self::Stereo16 => 2,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_bytes(self) -> usize {
        self.channels() * 2
    }
}

/// Playback state of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Created, never played
    Initial,
    Playing,
    /// Stopped explicitly or ran out of queued audio
    Stopped,
}

/// Voice/buffer-queue audio output.
///
/// Implementations must be usable from several threads at once: the engine
/// calls into the device from the tick loop and from whichever thread
/// switches tracks.
pub trait PlaybackDevice: Send + Sync {
    fn create_voice(&self) -> DeviceResult<VoiceId>;
    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Make the voice non-positional: fixed at the listener, no attenuation.
    fn set_ambient(&self, voice: VoiceId) -> DeviceResult<()>;

    fn create_buffer(&self) -> DeviceResult<BufferId>;
    fn delete_buffer(&self, buffer: BufferId) -> DeviceResult<()>;

    /// Replace the contents of `buffer` with `data` at `sample_rate`.
    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> DeviceResult<()>;

    /// Append buffers to the voice queue, in order.
    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()>;

    /// Remove the oldest queued buffer. Fails if it has not been processed.
    fn unqueue_buffer(&self, voice: VoiceId) -> DeviceResult<BufferId>;

    /// Number of queued buffers the voice has finished playing
    fn processed_buffers(&self, voice: VoiceId) -> DeviceResult<usize>;

    /// Number of buffers currently queued, processed or not
    fn queued_buffers(&self, voice: VoiceId) -> DeviceResult<usize>;

    fn play(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Stop playback. Every queued buffer becomes processed.
    fn stop(&self, voice: VoiceId) -> DeviceResult<()>;

    fn state(&self, voice: VoiceId) -> DeviceResult<VoiceState>;

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()>;
    fn gain(&self, voice: VoiceId) -> DeviceResult<f32>;
}

impl<D: PlaybackDevice + ?Sized> PlaybackDevice for std::sync::Arc<D> {
    fn create_voice(&self) -> DeviceResult<VoiceId> {
        (**self).create_voice()
    }
    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        (**self).delete_voice(voice)
    }
    fn set_ambient(&self, voice: VoiceId) -> DeviceResult<()> {
        (**self).set_ambient(voice)
    }
    fn create_buffer(&self) -> DeviceResult<BufferId> {
        (**self).create_buffer()
    }
    fn delete_buffer(&self, buffer: BufferId) -> DeviceResult<()> {
        (**self).delete_buffer(buffer)
    }
    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> DeviceResult<()> {
        (**self).buffer_data(buffer, format, data, sample_rate)
    }
    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        (**self).queue_buffers(voice, buffers)
    }
    fn unqueue_buffer(&self, voice: VoiceId) -> DeviceResult<BufferId> {
        (**self).unqueue_buffer(voice)
    }
    fn processed_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        (**self).processed_buffers(voice)
    }
    fn queued_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        (**self).queued_buffers(voice)
    }
    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        (**self).play(voice)
    }
    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        (**self).stop(voice)
    }
    fn state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        (**self).state(voice)
    }
    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        (**self).set_gain(voice, gain)
    }
    fn gain(&self, voice: VoiceId) -> DeviceResult<f32> {
        (**self).gain(voice)
    }
}
