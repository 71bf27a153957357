//! Music engine implementation

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::metrics::StreamMetrics;
use crate::config::StreamConfig;
use crate::decode::{TrackDecoder, TrackLoader};
use crate::device::{BufferId, PlaybackDevice, SampleFormat, VoiceId, VoiceState};
use crate::error::{DecodeError, DeviceError, MusicError};
use crate::track::{TrackId, TrackInfo};

/// Buffers cycled by one engine
pub const BUFFER_COUNT: usize = 2;

/// Per-tick gain divisor while fading out
pub const FADE_DIVISOR: f32 = 1.1;

/// What a single `update()` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No buffer had finished playing
    Idle,
    /// One buffer was refilled and queued again
    Requeued { buffer: BufferId, looped: bool },
    /// The track changed during the decode; the buffer was left unqueued
    Discarded { buffer: BufferId },
    /// No track is loaded
    Unloaded,
    /// A device error was logged and the tick abandoned
    Faulted,
}

/// An open track. The decoder sits behind its own lock so a tick can decode
/// from it without holding the track lock.
struct Loaded<Dec> {
    track: TrackId,
    info: TrackInfo,
    decoder: Arc<Mutex<Dec>>,
}

struct TrackState<Dec> {
    /// Bumped on every teardown
    generation: u64,
    loaded: Option<Loaded<Dec>>,
    /// Dequeued buffer whose requeue failed; retried on the next tick
    orphan: Option<BufferId>,
}

/// Everything the decode path needs, copied out under the lock
struct Snapshot<Dec> {
    generation: u64,
    track: TrackId,
    format: SampleFormat,
    sample_rate: u32,
    decoder: Arc<Mutex<Dec>>,
}

/// Result of streaming one chunk into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStatus {
    /// Buffer filled completely
    Active,
    /// Stream ended; `filled` if some audio still went into the buffer
    Exhausted { filled: bool },
    /// The track was replaced mid-read; nothing was submitted
    Stale,
}

/// Double-buffered streaming music player for one voice.
///
/// All methods take `&self`: share the engine behind an `Arc` between the
/// tick loop and whichever thread switches tracks. `update()` must not be
/// called from two threads at once.
pub struct MusicEngine<D: PlaybackDevice, L: TrackLoader> {
    device: D,
    loader: L,
    voice: VoiceId,
    buffers: [BufferId; BUFFER_COUNT],
    state: Mutex<TrackState<L::Decoder>>,
    /// f64 seconds stored as bits
    loop_offset: AtomicU64,
    fade: AtomicBool,
    /// Decode scratch region, one chunk long
    scratch: Mutex<Vec<u8>>,
    metrics: Mutex<StreamMetrics>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("Music {} mutex poisoned; continuing", what);
        e.into_inner()
    })
}

fn open_track<L: TrackLoader>(loader: &L, track: TrackId) -> Result<Loaded<L::Decoder>, MusicError> {
    let decoder = loader
        .open(track)
        .map_err(|source| MusicError::Open { track, source })?;
    let info = decoder.info().clone();
    Ok(Loaded {
        track,
        info,
        decoder: Arc::new(Mutex::new(decoder)),
    })
}

/// Allocate both buffers, freeing the first if the second fails.
fn allocate_buffers<D: PlaybackDevice>(device: &D) -> Result<[BufferId; BUFFER_COUNT], DeviceError> {
    let first = device.create_buffer()?;
    match device.create_buffer() {
        Ok(second) => Ok([first, second]),
        Err(e) => {
            if let Err(cleanup) = device.delete_buffer(first) {
                warn!("Failed to free {} after allocation error: {}", first, cleanup);
            }
            Err(e)
        }
    }
}

fn free_resources<D: PlaybackDevice>(device: &D, voice: VoiceId, buffers: &[BufferId]) {
    for &buffer in buffers {
        if let Err(e) = device.delete_buffer(buffer) {
            warn!("Failed to delete {}: {}", buffer, e);
        }
    }
    if let Err(e) = device.delete_voice(voice) {
        warn!("Failed to delete {}: {}", voice, e);
    }
}

impl<D: PlaybackDevice, L: TrackLoader> MusicEngine<D, L> {
    /// Open `track` and allocate the voice and both buffers.
    ///
    /// Nothing plays until [`play`](Self::play). On failure every resource
    /// allocated so far is released before the error is returned.
    pub fn new(
        device: D,
        loader: L,
        track: TrackId,
        loop_offset: f64,
        config: &StreamConfig,
    ) -> Result<Self, MusicError> {
        let loaded = open_track(&loader, track)?;

        let voice = device.create_voice().map_err(MusicError::Init)?;
        let buffers = match allocate_buffers(&device) {
            Ok(buffers) => buffers,
            Err(e) => {
                free_resources(&device, voice, &[]);
                return Err(MusicError::Init(e));
            }
        };

        let setup = device
            .set_ambient(voice)
            .and_then(|()| device.set_gain(voice, config.initial_volume));
        if let Err(e) = setup {
            free_resources(&device, voice, &buffers);
            return Err(MusicError::Init(e));
        }

        // Chunks must hold whole 16-bit stereo frames
        let chunk_bytes = (config.chunk_bytes & !3).max(4);

        debug!(
            "Music engine ready: {}, {:?}, {} byte chunks, track {} ({} ch @ {} Hz)",
            voice,
            buffers,
            chunk_bytes,
            loader.describe(track),
            loaded.info.channels,
            loaded.info.sample_rate
        );

        Ok(Self {
            device,
            loader,
            voice,
            buffers,
            state: Mutex::new(TrackState {
                generation: 0,
                loaded: Some(loaded),
                orphan: None,
            }),
            loop_offset: AtomicU64::new(loop_offset.to_bits()),
            fade: AtomicBool::new(false),
            scratch: Mutex::new(vec![0; chunk_bytes]),
            metrics: Mutex::new(StreamMetrics::new()),
        })
    }

    /// Decode the first two chunks, queue both buffers, and start playback.
    ///
    /// Anything still queued from earlier playback is dropped first.
    pub fn play(&self) -> Result<(), MusicError> {
        let snapshot = self
            .snapshot()
            .ok_or_else(|| MusicError::Stream("no track loaded".into()))?;
        let name = self.loader.describe(snapshot.track);

        if self.device.queued_buffers(self.voice)? > 0 {
            self.device.stop(self.voice)?;
            self.unqueue_pending()?;
        }

        for &buffer in &self.buffers {
            let mut status = self.stream_chunk(&snapshot, buffer)?;
            if status == (ChunkStatus::Exhausted { filled: false }) {
                // Track shorter than the buffer pair: wrap around once
                self.seek_to_loop(&snapshot)
                    .map_err(|e| MusicError::Stream(format!("failed to loop {}: {}", name, e)))?;
                status = self.stream_chunk(&snapshot, buffer)?;
            }
            match status {
                ChunkStatus::Active => {}
                ChunkStatus::Exhausted { filled: true } => {
                    self.seek_to_loop(&snapshot).map_err(|e| {
                        MusicError::Stream(format!("failed to loop {}: {}", name, e))
                    })?;
                }
                ChunkStatus::Exhausted { filled: false } => {
                    return Err(MusicError::Stream(format!("{} produced no audio", name)));
                }
                ChunkStatus::Stale => {
                    return Err(MusicError::Stream(format!(
                        "{} was replaced while starting",
                        name
                    )));
                }
            }
        }

        let mut state = lock(&self.state, "track");
        if state.generation != snapshot.generation {
            return Err(MusicError::Stream(format!(
                "{} was replaced while starting",
                name
            )));
        }
        // Both buffers go back in below
        state.orphan = None;
        self.device.queue_buffers(self.voice, &self.buffers)?;
        self.device.play(self.voice)?;
        drop(state);

        debug!("Playing {}", name);
        Ok(())
    }

    /// Replace the current track.
    ///
    /// Stops playback and tears down the old decoder before opening the new
    /// one. If the open fails, the engine stays unloaded (silent) until the
    /// next successful `set_music`. Call [`play`](Self::play) afterwards.
    pub fn set_music(&self, track: TrackId, loop_offset: f64) -> Result<(), MusicError> {
        let mut state = lock(&self.state, "track");

        let previous = state.loaded.as_ref().map(|l| l.track);
        self.release(&mut state)?;

        let loaded = open_track(&self.loader, track)?;
        self.set_loop_time(loop_offset);
        info!(
            "Music switched {} -> {} (loop at {:.2}s)",
            previous.map_or_else(|| "nothing".to_string(), |t| self.loader.describe(t)),
            self.loader.describe(track),
            loop_offset
        );
        state.loaded = Some(loaded);
        Ok(())
    }

    /// Advance the stream by at most one buffer. Call once per tick.
    ///
    /// Device and decoder errors are logged and counted, never returned:
    /// a lost tick is recovered on the next one.
    pub fn update(&self) -> TickOutcome {
        let mut metrics = lock(&self.metrics, "metrics");
        metrics.record_tick();
        let outcome = self.tick(&mut metrics);
        metrics.maybe_log();
        outcome
    }

    fn tick(&self, metrics: &mut StreamMetrics) -> TickOutcome {
        if self.fade.load(Ordering::Relaxed) {
            let faded = self
                .device
                .gain(self.voice)
                .and_then(|gain| self.device.set_gain(self.voice, gain / FADE_DIVISOR));
            if let Err(e) = faded {
                warn!("Music fade failed: {}", e);
                metrics.record_error();
            }
        }

        // Snapshot and dequeue in one critical section: a switch can't slip
        // in and hand this tick a buffer that belongs to the new track
        let (snapshot, buffer) = {
            let mut state = lock(&self.state, "track");
            let Some(snapshot) = Self::snapshot_of(&state) else {
                return TickOutcome::Unloaded;
            };

            if let Some(buffer) = state.orphan.take() {
                return match self.device.queue_buffers(self.voice, &[buffer]) {
                    Ok(()) => {
                        debug!("Music tick: requeued {} after an earlier failure", buffer);
                        metrics.record_requeue();
                        TickOutcome::Requeued {
                            buffer,
                            looped: false,
                        }
                    }
                    Err(e) => {
                        state.orphan = Some(buffer);
                        warn!("Music tick: failed to queue {} again: {}", buffer, e);
                        metrics.record_error();
                        TickOutcome::Faulted
                    }
                };
            }

            let processed = match self.device.processed_buffers(self.voice) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Music tick: failed to query processed buffers: {}", e);
                    metrics.record_error();
                    return TickOutcome::Faulted;
                }
            };
            if processed == 0 {
                return TickOutcome::Idle;
            }

            match self.device.unqueue_buffer(self.voice) {
                Ok(buffer) => (snapshot, buffer),
                Err(e) => {
                    warn!("Music tick: failed to unqueue buffer: {}", e);
                    metrics.record_error();
                    return TickOutcome::Faulted;
                }
            }
        };

        let mut status = self.stream_chunk_logged(&snapshot, buffer, metrics);
        let mut looped = false;
        if let ChunkStatus::Exhausted { filled } = status {
            looped = true;
            metrics.record_loop();
            if let Err(e) = self.seek_to_loop(&snapshot) {
                warn!("Music tick: loop seek failed: {}", e);
                metrics.record_error();
            }
            if !filled {
                // Nothing went into the buffer: refill from the loop point so
                // it doesn't replay its previous contents
                status = self.stream_chunk_logged(&snapshot, buffer, metrics);
                if status == (ChunkStatus::Exhausted { filled: false }) {
                    warn!(
                        "{} produced no audio after seeking to its loop point",
                        self.loader.describe(snapshot.track)
                    );
                }
            }
        }

        let mut state = lock(&self.state, "track");
        if status == ChunkStatus::Stale || state.generation != snapshot.generation {
            drop(state);
            debug!("Music tick: track changed mid-decode, dropping {}", buffer);
            metrics.record_discard();
            return TickOutcome::Discarded { buffer };
        }
        if let Err(e) = self.device.queue_buffers(self.voice, &[buffer]) {
            // Keep it so the pair stays whole; the next tick tries again
            state.orphan = Some(buffer);
            warn!("Music tick: failed to queue {}: {}", buffer, e);
            metrics.record_error();
            return TickOutcome::Faulted;
        }
        drop(state);

        metrics.record_requeue();
        TickOutcome::Requeued { buffer, looped }
    }

    fn stream_chunk_logged(
        &self,
        snapshot: &Snapshot<L::Decoder>,
        buffer: BufferId,
        metrics: &mut StreamMetrics,
    ) -> ChunkStatus {
        match self.stream_chunk(snapshot, buffer) {
            Ok(status) => status,
            Err(e) => {
                // The buffer keeps its old contents; it still goes back in
                // the queue so the pair stays in circulation
                warn!("Music tick: failed to fill {}: {}", buffer, e);
                metrics.record_error();
                ChunkStatus::Active
            }
        }
    }

    /// Decode up to one chunk from the snapshot's decoder into `buffer`.
    ///
    /// The generation is checked before every read and again, under the
    /// lock, before the data is handed to the device.
    fn stream_chunk(
        &self,
        snapshot: &Snapshot<L::Decoder>,
        buffer: BufferId,
    ) -> Result<ChunkStatus, DeviceError> {
        let mut scratch = lock(&self.scratch, "scratch");
        let mut filled = 0;
        let mut exhausted = false;

        {
            let mut decoder = lock(&snapshot.decoder, "decoder");
            while filled < scratch.len() {
                if !self.is_current(snapshot.generation) {
                    return Ok(ChunkStatus::Stale);
                }
                match decoder.read(&mut scratch[filled..]) {
                    Ok(0) => {
                        exhausted = true;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(e) => {
                        warn!(
                            "Decode error in {}: {}",
                            self.loader.describe(snapshot.track),
                            e
                        );
                        exhausted = true;
                        break;
                    }
                }
            }
        }

        if filled == 0 {
            return Ok(ChunkStatus::Exhausted { filled: false });
        }

        let state = lock(&self.state, "track");
        if state.generation != snapshot.generation {
            return Ok(ChunkStatus::Stale);
        }
        self.device.buffer_data(
            buffer,
            snapshot.format,
            &scratch[..filled],
            snapshot.sample_rate,
        )?;
        drop(state);

        Ok(if exhausted {
            ChunkStatus::Exhausted { filled: true }
        } else {
            ChunkStatus::Active
        })
    }

    fn seek_to_loop(&self, snapshot: &Snapshot<L::Decoder>) -> Result<(), DecodeError> {
        let seconds = self.loop_time();
        debug!(
            "{} reached end of stream, seeking to {:.2}s",
            self.loader.describe(snapshot.track),
            seconds
        );
        lock(&snapshot.decoder, "decoder").seek(seconds)
    }

    fn snapshot(&self) -> Option<Snapshot<L::Decoder>> {
        Self::snapshot_of(&lock(&self.state, "track"))
    }

    fn snapshot_of(state: &TrackState<L::Decoder>) -> Option<Snapshot<L::Decoder>> {
        state.loaded.as_ref().map(|loaded| Snapshot {
            generation: state.generation,
            track: loaded.track,
            format: loaded.info.format,
            sample_rate: loaded.info.sample_rate,
            decoder: loaded.decoder.clone(),
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.state, "track").generation == generation
    }

    /// Stop playback, clear the queue, and drop the decoder. Caller holds
    /// the track lock.
    fn release(&self, state: &mut TrackState<L::Decoder>) -> Result<(), DeviceError> {
        state.generation = state.generation.wrapping_add(1);
        state.orphan = None;
        let old = state.loaded.take();

        self.device.stop(self.voice)?;
        self.unqueue_pending()?;

        // An in-flight tick may still hold the decoder; it closes when that
        // tick finishes
        drop(old);
        Ok(())
    }

    fn unqueue_pending(&self) -> Result<(), DeviceError> {
        let queued = self.device.queued_buffers(self.voice)?;
        for _ in 0..queued {
            self.device.unqueue_buffer(self.voice)?;
        }
        Ok(())
    }

    /// Loop point used the next time the stream runs out
    pub fn set_loop_time(&self, seconds: f64) {
        self.loop_offset.store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn loop_time(&self) -> f64 {
        f64::from_bits(self.loop_offset.load(Ordering::Relaxed))
    }

    /// Divide the gain by [`FADE_DIVISOR`] on every tick while enabled.
    pub fn set_fade(&self, enabled: bool) {
        self.fade.store(enabled, Ordering::Relaxed);
    }

    pub fn is_fading(&self) -> bool {
        self.fade.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, gain: f32) -> Result<(), MusicError> {
        Ok(self.device.set_gain(self.voice, gain)?)
    }

    pub fn volume(&self) -> Result<f32, MusicError> {
        Ok(self.device.gain(self.voice)?)
    }

    pub fn is_playing(&self) -> Result<bool, MusicError> {
        Ok(self.device.state(self.voice)? == VoiceState::Playing)
    }

    pub fn current_track(&self) -> Option<TrackId> {
        lock(&self.state, "track").loaded.as_ref().map(|l| l.track)
    }

    /// Header of the loaded track
    pub fn track_info(&self) -> Option<TrackInfo> {
        lock(&self.state, "track")
            .loaded
            .as_ref()
            .map(|l| l.info.clone())
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn buffers(&self) -> [BufferId; BUFFER_COUNT] {
        self.buffers
    }

    pub fn metrics(&self) -> StreamMetrics {
        lock(&self.metrics, "metrics").clone()
    }
}

impl<D: PlaybackDevice, L: TrackLoader> Drop for MusicEngine<D, L> {
    fn drop(&mut self) {
        let old = self
            .state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .loaded
            .take();

        if let Err(e) = self.device.stop(self.voice) {
            warn!("Failed to stop music voice: {}", e);
        }
        if let Err(e) = self.unqueue_pending() {
            warn!("Failed to unqueue music buffers: {}", e);
        }
        drop(old);

        free_resources(&self.device, self.voice, &self.buffers);
        debug!("Music engine released {}", self.voice);
    }
}
