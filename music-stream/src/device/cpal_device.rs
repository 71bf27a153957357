//! Software voice/buffer queue on top of a cpal output stream
//!
//! # Architecture
//!
//! ```text
//! Engine threads                 Device state (Mutex)          cpal Thread
//!     │                                │                           │
//! [buffer_data]─────────────────►[buffer table]                    │
//! [queue_buffers]──(resample)───►[voice ring]──────(ring)───────►[Mixer]
//! [processed_buffers]◄──────────[end markers]◄──(consumed)────────[Mixer]
//! ```
//!
//! Each voice owns a lock-free ring and a resampler. Queueing a buffer
//! converts its PCM into the ring, carrying the resampler position from the
//! previous buffer, and records the ring position where it ends. The
//! mixer publishes how many samples it has consumed per voice, so a buffer
//! is processed once `consumed >= end`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use hashbrown::HashMap;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, warn};

use super::convert::{max_output_frames, Resampler};
use super::{BufferId, PlaybackDevice, SampleFormat, VoiceId, VoiceState, MIN_SAMPLE_RATE};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::music::BUFFER_COUNT;

/// Output samples mixed per pass; callbacks larger than this mix in blocks
const MIX_BLOCK: usize = 4096;

/// Chunks a voice ring must hold: a full queue, plus a full queue's worth of
/// stopped audio the mixer hasn't skipped yet
const RING_CHUNKS: u64 = 2 * BUFFER_COUNT as u64;

/// Shared between the device and the mixer callback, one per voice
struct VoiceAtomics {
    /// Mixer pulls samples only while set
    playing: AtomicBool,
    /// f32 gain stored as bits
    gain: AtomicU32,
    /// Samples popped or skipped by the mixer since the voice slot was created
    consumed: AtomicU64,
    /// Mixer drops samples until `consumed` reaches this (set by `stop`)
    discard_until: AtomicU64,
}

impl VoiceAtomics {
    fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
            consumed: AtomicU64::new(0),
            discard_until: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QueuedBuffer {
    id: BufferId,
    /// Ring position one past the buffer's last sample
    end: u64,
}

struct VoiceSlot {
    in_use: bool,
    state: VoiceState,
    producer: HeapProd<f32>,
    /// Samples pushed into the ring since the slot was created
    pushed: u64,
    /// Everything up to here counts as processed regardless of the mixer
    stopped_at: u64,
    queue: VecDeque<QueuedBuffer>,
    resampler: Resampler,
}

/// PCM as submitted; converted when queued
#[derive(Default)]
struct PcmBuffer {
    format: Option<SampleFormat>,
    sample_rate: u32,
    data: Vec<u8>,
}

struct DeviceState {
    voices: Vec<VoiceSlot>,
    buffers: HashMap<BufferId, PcmBuffer>,
    next_buffer: u32,
}

/// Output stream layout negotiated with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Mixer side of the voice rings, owned by the output callback
pub(super) struct Mixer {
    consumers: Vec<HeapCons<f32>>,
    voices: Arc<[VoiceAtomics]>,
    mix: Vec<f32>,
    scratch: Vec<f32>,
}

impl Mixer {
    fn new(consumers: Vec<HeapCons<f32>>, voices: Arc<[VoiceAtomics]>, channels: usize) -> Self {
        // Whole frames, so a block boundary never splits one
        let block = (MIX_BLOCK - MIX_BLOCK % channels.max(1)).max(channels);
        Self {
            consumers,
            voices,
            mix: vec![0.0; block],
            scratch: vec![0.0; block],
        }
    }

    /// Fill an output callback buffer, one preallocated block at a time.
    pub(super) fn mix_into<T>(&mut self, data: &mut [T])
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let block = self.mix.len();
        for out in data.chunks_mut(block) {
            let mixed = self.render(out.len());
            for (out, &sample) in out.iter_mut().zip(mixed) {
                *out = T::from_sample(sample.clamp(-1.0, 1.0));
            }
        }
    }

    /// Mix up to one block of interleaved output samples from every playing
    /// voice. Never allocates.
    pub(super) fn render(&mut self, len: usize) -> &[f32] {
        let len = len.min(self.mix.len());
        let mix = &mut self.mix[..len];
        mix.fill(0.0);

        for (consumer, voice) in self.consumers.iter_mut().zip(self.voices.iter()) {
            let consumed = voice.consumed.load(Ordering::Acquire);
            let discard_until = voice.discard_until.load(Ordering::Acquire);
            if discard_until > consumed {
                let skipped = consumer.skip((discard_until - consumed) as usize);
                voice.consumed.fetch_add(skipped as u64, Ordering::Release);
            }

            if !voice.playing.load(Ordering::Relaxed) {
                continue;
            }

            let popped = consumer.pop_slice(&mut self.scratch[..len]);
            voice.consumed.fetch_add(popped as u64, Ordering::Release);

            let gain = f32::from_bits(voice.gain.load(Ordering::Relaxed));
            for (out, &sample) in mix.iter_mut().zip(&self.scratch[..popped]) {
                *out += sample * gain;
            }
        }

        mix
    }
}

/// Owns the thread the cpal stream lives on.
///
/// `cpal::Stream` is not `Send` on every host, so it is created, kept, and
/// dropped on one dedicated thread.
struct StreamThread {
    /// Dropping this wakes the thread and closes the stream
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        // Drop the sender FIRST so the thread's recv() returns, then join
        drop(self.shutdown.take());

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Software implementation of [`PlaybackDevice`] over the default cpal output.
pub struct CpalDevice {
    voices: Arc<[VoiceAtomics]>,
    state: Mutex<DeviceState>,
    format: OutputFormat,
    _stream: Option<StreamThread>,
}

impl CpalDevice {
    /// Open the default output device and start the mixer stream.
    ///
    /// Voice rings are sized for `config.queue_capacity_ms` of audio, and at
    /// least for the engine's queue of `chunk_bytes` chunks at the lowest
    /// accepted source rate.
    pub fn open(config: &DeviceConfig, chunk_bytes: usize) -> DeviceResult<Self> {
        if config.max_voices == 0 {
            return Err(DeviceError::InvalidValue("max_voices must be at least 1".into()));
        }
        let voices: Arc<[VoiceAtomics]> = (0..config.max_voices).map(|_| VoiceAtomics::new()).collect();

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_voices = voices.clone();
        let queue_capacity_ms = config.queue_capacity_ms;

        let handle = thread::Builder::new()
            .name("music-device".into())
            .spawn(move || {
                let stream = match open_stream(thread_voices, queue_capacity_ms, chunk_bytes) {
                    Ok((stream, format, producers)) => {
                        let _ = ready_tx.send(Ok((format, producers)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until the device is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Music device stream closed");
            })
            .map_err(|e| DeviceError::StreamBuild(format!("failed to spawn device thread: {}", e)))?;

        let stream = StreamThread {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        };

        let (format, producers) = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                return Err(DeviceError::StreamBuild(
                    "device thread exited during startup".into(),
                ));
            }
        };

        debug!(
            "Music device started at {}Hz, {} channels, {} voices",
            format.sample_rate,
            format.channels,
            voices.len()
        );

        Ok(Self::with_producers(voices, producers, format, Some(stream)))
    }

    fn with_producers(
        voices: Arc<[VoiceAtomics]>,
        producers: Vec<HeapProd<f32>>,
        format: OutputFormat,
        stream: Option<StreamThread>,
    ) -> Self {
        let slots = producers
            .into_iter()
            .map(|producer| VoiceSlot {
                in_use: false,
                state: VoiceState::Initial,
                producer,
                pushed: 0,
                stopped_at: 0,
                queue: VecDeque::new(),
                resampler: Resampler::default(),
            })
            .collect();

        Self {
            voices,
            state: Mutex::new(DeviceState {
                voices: slots,
                buffers: HashMap::new(),
                next_buffer: 1,
            }),
            format,
            _stream: stream,
        }
    }

    /// Device with rings but no cpal stream; the caller drives the mixer.
    #[cfg(test)]
    pub(super) fn detached(max_voices: usize, ring_capacity: usize, format: OutputFormat) -> (Self, Mixer) {
        let voices: Arc<[VoiceAtomics]> = (0..max_voices).map(|_| VoiceAtomics::new()).collect();
        let (producers, consumers): (Vec<_>, Vec<_>) = (0..max_voices)
            .map(|_| HeapRb::<f32>::new(ring_capacity).split())
            .unzip();
        let mixer = Mixer::new(consumers, voices.clone(), format.channels as usize);
        (Self::with_producers(voices, producers, format, None), mixer)
    }

    /// Output stream layout
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("Music device state mutex poisoned; continuing");
            e.into_inner()
        })
    }
}

fn voice_slot(voices: &mut [VoiceSlot], voice: VoiceId) -> DeviceResult<&mut VoiceSlot> {
    voices
        .get_mut(voice.0 as usize)
        .filter(|slot| slot.in_use)
        .ok_or(DeviceError::InvalidHandle {
            kind: "voice",
            id: voice.0,
        })
}

fn invalid_buffer(buffer: BufferId) -> DeviceError {
    DeviceError::InvalidHandle {
        kind: "buffer",
        id: buffer.0,
    }
}

impl VoiceSlot {
    fn processed(&self, atomics: &VoiceAtomics) -> usize {
        let done = atomics.consumed.load(Ordering::Acquire).max(self.stopped_at);
        self.queue.iter().take_while(|q| q.end <= done).count()
    }

    fn halt(&mut self, atomics: &VoiceAtomics) {
        atomics.playing.store(false, Ordering::Relaxed);
        atomics.discard_until.store(self.pushed, Ordering::Release);
        self.stopped_at = self.pushed;
        self.state = VoiceState::Stopped;
        self.resampler.reset();
    }
}

impl PlaybackDevice for CpalDevice {
    fn create_voice(&self) -> DeviceResult<VoiceId> {
        let mut state = self.lock();
        let index = state
            .voices
            .iter()
            .position(|slot| !slot.in_use)
            .ok_or(DeviceError::OutOfResources("voices"))?;

        let atomics = &self.voices[index];
        let slot = &mut state.voices[index];
        slot.halt(atomics);
        slot.in_use = true;
        slot.state = VoiceState::Initial;
        slot.queue.clear();
        atomics.gain.store(1.0f32.to_bits(), Ordering::Relaxed);

        Ok(VoiceId(index as u32))
    }

    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        slot.halt(&self.voices[voice.0 as usize]);
        slot.queue.clear();
        slot.in_use = false;
        Ok(())
    }

    fn set_ambient(&self, voice: VoiceId) -> DeviceResult<()> {
        // The software mixer has no positional audio; every voice is ambient
        let mut state = self.lock();
        voice_slot(&mut state.voices, voice).map(|_| ())
    }

    fn create_buffer(&self) -> DeviceResult<BufferId> {
        let mut state = self.lock();
        let id = BufferId(state.next_buffer);
        state.next_buffer = state
            .next_buffer
            .checked_add(1)
            .ok_or(DeviceError::OutOfResources("buffer names"))?;
        state.buffers.insert(id, PcmBuffer::default());
        Ok(id)
    }

    fn delete_buffer(&self, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.lock();
        let queued = state
            .voices
            .iter()
            .any(|slot| slot.in_use && slot.queue.iter().any(|q| q.id == buffer));
        if queued {
            return Err(DeviceError::InvalidOperation("buffer is still queued"));
        }
        state
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| invalid_buffer(buffer))
    }

    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> DeviceResult<()> {
        if sample_rate == 0 {
            return Err(DeviceError::InvalidValue("sample rate must be non-zero".into()));
        }

        let mut state = self.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| invalid_buffer(buffer))?;
        slot.format = Some(format);
        slot.sample_rate = sample_rate;
        slot.data.clear();
        slot.data.extend_from_slice(data);
        Ok(())
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let slot = voice_slot(&mut state.voices, voice)?;

        // Convert on a copy of the resampler; it only advances if the whole
        // batch fits
        let mut resampler = slot.resampler.clone();
        let mut converted = Vec::with_capacity(buffers.len());
        for id in buffers {
            let pcm = state.buffers.get(id).ok_or_else(|| invalid_buffer(*id))?;
            let mut samples = Vec::new();
            if let Some(format) = pcm.format {
                resampler.process(
                    &pcm.data,
                    format,
                    pcm.sample_rate,
                    self.format.sample_rate,
                    self.format.channels as usize,
                    &mut samples,
                );
            }
            converted.push((*id, samples));
        }

        let needed = converted.iter().map(|(_, samples)| samples.len()).sum();
        let available = slot.producer.vacant_len();
        if needed > available {
            return Err(DeviceError::QueueFull { needed, available });
        }

        slot.resampler = resampler;
        for (id, samples) in converted {
            let pushed = slot.producer.push_slice(&samples);
            slot.pushed += pushed as u64;
            slot.queue.push_back(QueuedBuffer {
                id,
                end: slot.pushed,
            });
        }
        Ok(())
    }

    fn unqueue_buffer(&self, voice: VoiceId) -> DeviceResult<BufferId> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        if slot.processed(&self.voices[voice.0 as usize]) == 0 {
            return Err(DeviceError::InvalidOperation("no processed buffer to unqueue"));
        }
        slot.queue
            .pop_front()
            .map(|q| q.id)
            .ok_or(DeviceError::InvalidOperation("no buffer queued"))
    }

    fn processed_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        Ok(slot.processed(&self.voices[voice.0 as usize]))
    }

    fn queued_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        let mut state = self.lock();
        Ok(voice_slot(&mut state.voices, voice)?.queue.len())
    }

    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        slot.state = VoiceState::Playing;
        self.voices[voice.0 as usize]
            .playing
            .store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        slot.halt(&self.voices[voice.0 as usize]);
        Ok(())
    }

    fn state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        let mut state = self.lock();
        let slot = voice_slot(&mut state.voices, voice)?;
        let consumed = self.voices[voice.0 as usize]
            .consumed
            .load(Ordering::Acquire);
        // A playing voice that ran dry reports Stopped until more audio is queued
        if slot.state == VoiceState::Playing && consumed >= slot.pushed {
            return Ok(VoiceState::Stopped);
        }
        Ok(slot.state)
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(DeviceError::InvalidValue(format!("gain {}", gain)));
        }
        let mut state = self.lock();
        voice_slot(&mut state.voices, voice)?;
        self.voices[voice.0 as usize]
            .gain
            .store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn gain(&self, voice: VoiceId) -> DeviceResult<f32> {
        let mut state = self.lock();
        voice_slot(&mut state.voices, voice)?;
        Ok(f32::from_bits(
            self.voices[voice.0 as usize].gain.load(Ordering::Relaxed),
        ))
    }
}

/// Ring capacity in samples: `ms` milliseconds of output audio, but never
/// less than [`RING_CHUNKS`] mono `chunk_bytes` chunks at [`MIN_SAMPLE_RATE`]
/// once resampled to the output format.
fn ring_capacity(format: OutputFormat, ms: u32, chunk_bytes: usize) -> usize {
    let channels = format.channels as u64;
    let by_time = format.sample_rate as u64 * channels * ms.max(1) as u64 / 1000;

    let chunk_frames = (chunk_bytes / SampleFormat::Mono16.frame_bytes()) as u64;
    let chunk = max_output_frames(chunk_frames, MIN_SAMPLE_RATE, format.sample_rate) * channels;

    by_time.max(chunk * RING_CHUNKS).max(1024) as usize
}

type OpenedStream = (cpal::Stream, OutputFormat, Vec<HeapProd<f32>>);

fn open_stream(
    voices: Arc<[VoiceAtomics]>,
    queue_capacity_ms: u32,
    chunk_bytes: usize,
) -> DeviceResult<OpenedStream> {
    let host = cpal::default_host();

    let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;

    let supported = device
        .default_output_config()
        .map_err(|e| DeviceError::Config(e.to_string()))?;

    let format = OutputFormat {
        sample_rate: supported.sample_rate().0,
        channels: supported.channels(),
    };

    let capacity = ring_capacity(format, queue_capacity_ms, chunk_bytes);
    let (producers, consumers): (Vec<_>, Vec<_>) = (0..voices.len())
        .map(|_| HeapRb::<f32>::new(capacity).split())
        .unzip();
    let mixer = Mixer::new(consumers, voices, format.channels as usize);

    let config: cpal::StreamConfig = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer),
        other => {
            return Err(DeviceError::Config(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    }?;

    stream
        .play()
        .map_err(|e| DeviceError::Stream(format!("Failed to play audio stream: {}", e)))?;

    Ok((stream, format, producers))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
) -> DeviceResult<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| mixer.mix_into(data),
            |err| error!("Music stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamBuild(e.to_string()))
}
