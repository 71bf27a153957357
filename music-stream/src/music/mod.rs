//! Streaming music engine
//!
//! Plays one compressed track at a time through a single device voice,
//! cycling exactly two buffers: while the device plays one, the engine
//! refills the other.
//!
//! # Architecture
//!
//! ```text
//! Tick Thread                      Engine                      Switch Thread
//!     │                              │                              │
//! [update]──(snapshot gen,────────►[TrackState]◄──(lock)──────[set_music]
//!           unqueue)                 │                              │
//!     └──────►[decode chunk]         │                         [teardown]
//!     │         (no lock held)       │                         [open new]
//! [recheck gen]──(lock)──────────►[TrackState]                      │
//! [requeue or discard]               │                         [play]
//! ```
//!
//! The track lock is never held across a decode. Every track teardown bumps
//! a generation counter; the tick path compares the generation it started
//! with before submitting anything to the device, so audio decoded for a
//! track that has since been replaced is dropped instead of queued.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Arc::new(MusicEngine::new(device, library, title, 5.0, &config.stream)?);
//! engine.play()?;
//!
//! // Each frame
//! engine.update();
//!
//! // From a scene-change handler on another thread
//! engine.set_music(boss, 2.0)?;
//! engine.play()?;
//! ```

mod engine;
mod metrics;


pub use engine::{BUFFER_COUNT, FADE_DIVISOR, MusicEngine, TickOutcome};
pub use metrics::StreamMetrics;
