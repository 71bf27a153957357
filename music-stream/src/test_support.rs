//! Instrumented device and decoder fakes for engine tests

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use hashbrown::{HashMap, HashSet};

use crate::decode::{TrackDecoder, TrackLoader};
use crate::device::{BufferId, PlaybackDevice, SampleFormat, VoiceId, VoiceState};
use crate::error::{DecodeError, DeviceError, DeviceResult};
use crate::track::{TrackId, TrackInfo};

/// Sample rate of every fake track; one 16-byte chunk is one second of stereo
pub const FAKE_RATE: u32 = 4;

struct FakeVoice {
    queue: VecDeque<BufferId>,
    processed: usize,
    state: VoiceState,
    gain: f32,
    ambient: bool,
}

#[derive(Default)]
struct FakeState {
    voices: HashMap<u32, FakeVoice>,
    buffers: HashMap<u32, Vec<u8>>,
    next_id: u32,
    /// Buffer contents at the moment they were queued
    submissions: Vec<(BufferId, Vec<u8>)>,
    fail_voice_alloc: bool,
    buffer_limit: Option<usize>,
    fail_processed_query: bool,
    fail_buffer_data: bool,
    fail_queue: bool,
}

/// In-memory [`PlaybackDevice`]. Buffers only become processed when the test
/// says so via [`finish_buffers`](Self::finish_buffers) or when the voice
/// is stopped.
#[derive(Default)]
pub struct FakeDevice {
    state: Mutex<FakeState>,
    /// Parks the next `processed_buffers` call
    processed_gate: Mutex<Option<Gate>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the next `n` queued buffers as played.
    pub fn finish_buffers(&self, voice: VoiceId, n: usize) {
        let mut state = self.state.lock().unwrap();
        let v = state.voices.get_mut(&voice.0).unwrap();
        v.processed = (v.processed + n).min(v.queue.len());
    }

    pub fn live_voices(&self) -> usize {
        self.state.lock().unwrap().voices.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn queue(&self, voice: VoiceId) -> Vec<BufferId> {
        let state = self.state.lock().unwrap();
        state.voices[&voice.0].queue.iter().copied().collect()
    }

    pub fn is_ambient(&self, voice: VoiceId) -> bool {
        self.state.lock().unwrap().voices[&voice.0].ambient
    }

    pub fn submissions(&self) -> Vec<(BufferId, Vec<u8>)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn fail_voice_alloc(&self) {
        self.state.lock().unwrap().fail_voice_alloc = true;
    }

    /// Refuse to create buffers once `limit` are live.
    pub fn limit_buffers(&self, limit: usize) {
        self.state.lock().unwrap().buffer_limit = Some(limit);
    }

    pub fn fail_processed_query(&self, fail: bool) {
        self.state.lock().unwrap().fail_processed_query = fail;
    }

    pub fn fail_buffer_data(&self, fail: bool) {
        self.state.lock().unwrap().fail_buffer_data = fail;
    }

    pub fn fail_queue_buffers(&self, fail: bool) {
        self.state.lock().unwrap().fail_queue = fail;
    }

    /// Block the next processed-buffer query until the gate is released.
    pub fn arm_processed(&self, gate: Gate) {
        *self.processed_gate.lock().unwrap() = Some(gate);
    }

    fn with_voice<T>(
        &self,
        voice: VoiceId,
        f: impl FnOnce(&mut FakeVoice) -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        let mut state = self.state.lock().unwrap();
        let v = state.voices.get_mut(&voice.0).ok_or(DeviceError::InvalidHandle {
            kind: "voice",
            id: voice.0,
        })?;
        f(v)
    }
}

fn invalid_buffer(buffer: BufferId) -> DeviceError {
    DeviceError::InvalidHandle {
        kind: "buffer",
        id: buffer.0,
    }
}

impl PlaybackDevice for FakeDevice {
    fn create_voice(&self) -> DeviceResult<VoiceId> {
        let mut state = self.state.lock().unwrap();
        if state.fail_voice_alloc {
            return Err(DeviceError::OutOfResources("voices"));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.voices.insert(
            id,
            FakeVoice {
                queue: VecDeque::new(),
                processed: 0,
                state: VoiceState::Initial,
                gain: 1.0,
                ambient: false,
            },
        );
        Ok(VoiceId(id))
    }

    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        state.voices.remove(&voice.0).map(|_| ()).ok_or(DeviceError::InvalidHandle {
            kind: "voice",
            id: voice.0,
        })
    }

    fn set_ambient(&self, voice: VoiceId) -> DeviceResult<()> {
        self.with_voice(voice, |v| {
            v.ambient = true;
            Ok(())
        })
    }

    fn create_buffer(&self) -> DeviceResult<BufferId> {
        let mut state = self.state.lock().unwrap();
        if state.buffer_limit.is_some_and(|limit| state.buffers.len() >= limit) {
            return Err(DeviceError::OutOfResources("buffers"));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.buffers.insert(id, Vec::new());
        Ok(BufferId(id))
    }

    fn delete_buffer(&self, buffer: BufferId) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.voices.values().any(|v| v.queue.contains(&buffer)) {
            return Err(DeviceError::InvalidOperation("buffer is still queued"));
        }
        state
            .buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| invalid_buffer(buffer))
    }

    fn buffer_data(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        data: &[u8],
        _sample_rate: u32,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_buffer_data {
            return Err(DeviceError::OutOfResources("buffer memory"));
        }
        if data.len() % format.frame_bytes() != 0 {
            return Err(DeviceError::InvalidValue(format!(
                "{} bytes is not a whole number of frames",
                data.len()
            )));
        }
        let contents = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| invalid_buffer(buffer))?;
        contents.clear();
        contents.extend_from_slice(data);
        Ok(())
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_queue {
            return Err(DeviceError::Stream("device lost".into()));
        }
        let mut queued = Vec::with_capacity(buffers.len());
        for &buffer in buffers {
            let data = state
                .buffers
                .get(&buffer.0)
                .ok_or_else(|| invalid_buffer(buffer))?;
            queued.push((buffer, data.clone()));
        }
        let v = state.voices.get_mut(&voice.0).ok_or(DeviceError::InvalidHandle {
            kind: "voice",
            id: voice.0,
        })?;
        v.queue.extend(queued.iter().map(|(b, _)| *b));
        state.submissions.extend(queued);
        Ok(())
    }

    fn unqueue_buffer(&self, voice: VoiceId) -> DeviceResult<BufferId> {
        self.with_voice(voice, |v| {
            if v.processed == 0 {
                return Err(DeviceError::InvalidOperation("buffer not processed"));
            }
            v.processed -= 1;
            v.queue
                .pop_front()
                .ok_or(DeviceError::InvalidOperation("queue is empty"))
        })
    }

    fn processed_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        let gate = self.processed_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }
        if self.state.lock().unwrap().fail_processed_query {
            return Err(DeviceError::Stream("device lost".into()));
        }
        self.with_voice(voice, |v| Ok(v.processed))
    }

    fn queued_buffers(&self, voice: VoiceId) -> DeviceResult<usize> {
        self.with_voice(voice, |v| Ok(v.queue.len()))
    }

    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        self.with_voice(voice, |v| {
            v.state = VoiceState::Playing;
            Ok(())
        })
    }

    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        self.with_voice(voice, |v| {
            v.state = VoiceState::Stopped;
            v.processed = v.queue.len();
            Ok(())
        })
    }

    fn state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        self.with_voice(voice, |v| Ok(v.state))
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        self.with_voice(voice, |v| {
            v.gain = gain;
            Ok(())
        })
    }

    fn gain(&self, voice: VoiceId) -> DeviceResult<f32> {
        self.with_voice(voice, |v| Ok(v.gain))
    }
}

/// One-shot rendezvous that parks a fake call until released.
pub struct Gate {
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

/// Record of everything the fake decoders did
#[derive(Default)]
pub struct LoaderLog {
    pub opens: Mutex<Vec<TrackId>>,
    pub closes: Mutex<Vec<TrackId>>,
    pub seeks: Mutex<Vec<(TrackId, f64)>>,
    gate: Mutex<Option<Gate>>,
}

impl LoaderLog {
    /// Block the next read of any decoder on `gate`.
    pub fn arm(&self, gate: Gate) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.lock().unwrap().len()
    }
}

#[derive(Clone, Copy)]
struct FakeTrack {
    tag: i16,
    frames: usize,
}

/// Loader over synthetic stereo tracks.
///
/// Frame `i` of a track tagged `t` holds the sample `t * 1000 + i` in both
/// channels, so tests can tell from the PCM which track and position a
/// buffer came from.
#[derive(Default)]
pub struct FakeLoader {
    tracks: HashMap<TrackId, FakeTrack>,
    failing: HashSet<TrackId>,
    pub log: Arc<LoaderLog>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, track: TrackId, tag: i16, frames: usize) -> Self {
        self.tracks.insert(track, FakeTrack { tag, frames });
        self
    }

    pub fn with_failing(mut self, track: TrackId) -> Self {
        self.failing.insert(track);
        self
    }
}

impl TrackLoader for FakeLoader {
    type Decoder = FakeDecoder;

    fn open(&self, track: TrackId) -> Result<FakeDecoder, DecodeError> {
        if self.failing.contains(&track) {
            return Err(DecodeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "corrupt header",
            )));
        }
        let spec = *self
            .tracks
            .get(&track)
            .ok_or(DecodeError::UnknownTrack(track))?;
        self.log.opens.lock().unwrap().push(track);
        Ok(FakeDecoder {
            track,
            spec,
            position: 0,
            info: TrackInfo {
                channels: 2,
                sample_rate: FAKE_RATE,
                format: SampleFormat::Stereo16,
                vendor: "fake".into(),
                comments: Vec::new(),
            },
            log: self.log.clone(),
        })
    }
}

pub struct FakeDecoder {
    track: TrackId,
    spec: FakeTrack,
    position: usize,
    info: TrackInfo,
    log: Arc<LoaderLog>,
}

impl TrackDecoder for FakeDecoder {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn read(&mut self, out: &mut [u8]) -> Result<usize, DecodeError> {
        let gate = self.log.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.send(()).unwrap();
            gate.release.recv().unwrap();
        }

        let frames = (out.len() / 4).min(self.spec.frames - self.position);
        for (i, frame) in out.chunks_exact_mut(4).take(frames).enumerate() {
            let sample = sample_at(self.spec.tag, self.position + i);
            frame[..2].copy_from_slice(&sample.to_le_bytes());
            frame[2..].copy_from_slice(&sample.to_le_bytes());
        }
        self.position += frames;
        Ok(frames * 4)
    }

    fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        self.log.seeks.lock().unwrap().push((self.track, seconds));
        self.position = ((seconds * FAKE_RATE as f64) as usize).min(self.spec.frames);
        Ok(())
    }
}

impl Drop for FakeDecoder {
    fn drop(&mut self) {
        if let Ok(mut closes) = self.log.closes.lock() {
            closes.push(self.track);
        }
    }
}

/// Sample value of frame `frame` in a track tagged `tag`
pub fn sample_at(tag: i16, frame: usize) -> i16 {
    tag * 1000 + frame as i16
}

/// First left-channel sample of a submitted buffer
pub fn first_sample(data: &[u8]) -> i16 {
    i16::from_le_bytes([data[0], data[1]])
}
