//! PCM conversion from submitted buffers to the output stream layout

use super::SampleFormat;

/// Streaming converter from interleaved 16-bit LE PCM to f32 at the output
/// rate and channel count.
///
/// One per voice. Resampling is linear interpolation, and the fractional
/// read position and last input frame carry over from one buffer to the
/// next, so consecutive buffers resample as one continuous signal.
#[derive(Debug, Clone, Default)]
pub(super) struct Resampler {
    /// Source rate the carried position refers to
    src_rate: u32,
    /// Position of the next output frame, in input frames from the start of
    /// the next buffer. Always in `(-1, 0]` between buffers when upsampling.
    phase: f64,
    /// Final input frame of the previous buffer
    last: Option<[f32; 2]>,
}

impl Resampler {
    /// Forget the carried position, e.g. when the voice is stopped.
    pub(super) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Convert one buffer, appending output samples to `out`.
    ///
    /// Trailing bytes that don't form a whole frame are ignored.
    pub(super) fn process(
        &mut self,
        data: &[u8],
        format: SampleFormat,
        src_rate: u32,
        dst_rate: u32,
        dst_channels: usize,
        out: &mut Vec<f32>,
    ) {
        if src_rate == 0 || dst_rate == 0 || dst_channels == 0 {
            return;
        }
        if src_rate != self.src_rate {
            self.reset();
            self.src_rate = src_rate;
        }

        let src_channels = format.channels();
        let frames: Vec<[f32; 2]> = data
            .chunks_exact(format.frame_bytes())
            .map(|frame| {
                let left = i16::from_le_bytes([frame[0], frame[1]]) as f32 / 32768.0;
                let right = if src_channels == 2 {
                    i16::from_le_bytes([frame[2], frame[3]]) as f32 / 32768.0
                } else {
                    left
                };
                [left, right]
            })
            .collect();
        let Some(&tail) = frames.last() else {
            return;
        };

        if src_rate == dst_rate {
            out.reserve(frames.len() * dst_channels);
            for &frame in &frames {
                write_frame(out, frame, src_channels, dst_channels);
            }
        } else {
            let step = src_rate as f64 / dst_rate as f64;
            let last_index = (frames.len() - 1) as f64;
            let mut emitted = 0u64;
            loop {
                let pos = self.phase + emitted as f64 * step;
                if pos > last_index {
                    break;
                }
                let frame = if pos < 0.0 {
                    // Between the previous buffer's last frame and our first
                    let prev = self.last.unwrap_or(frames[0]);
                    lerp(prev, frames[0], (pos + 1.0) as f32)
                } else {
                    let idx = pos.floor() as usize;
                    let next = (idx + 1).min(frames.len() - 1);
                    lerp(frames[idx], frames[next], (pos - idx as f64) as f32)
                };
                write_frame(out, frame, src_channels, dst_channels);
                emitted += 1;
            }
            self.phase += emitted as f64 * step - frames.len() as f64;
        }

        self.last = Some(tail);
    }
}

/// Upper bound on the output frames [`Resampler::process`] produces for
/// `frames` input frames, whatever position it carries in.
pub(super) fn max_output_frames(frames: u64, src_rate: u32, dst_rate: u32) -> u64 {
    if src_rate == dst_rate || src_rate == 0 {
        frames
    } else {
        frames * dst_rate as u64 / src_rate as u64 + 1
    }
}

fn lerp(a: [f32; 2], b: [f32; 2], t: f32) -> [f32; 2] {
    [a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]
}

fn write_frame(out: &mut Vec<f32>, [left, right]: [f32; 2], src_channels: usize, dst_channels: usize) {
    match dst_channels {
        1 => out.push(if src_channels == 2 { (left + right) * 0.5 } else { left }),
        n => {
            out.push(left);
            out.push(right);
            // Surround layouts: music stays in the front pair
            out.extend(std::iter::repeat_n(0.0, n - 2));
        }
    }
}
