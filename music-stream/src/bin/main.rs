//! Music Stream - Standalone Player
//!
//! Plays tracks from a music table on the default audio output.
//!
//! # Usage
//!
//! ```bash
//! music-player --list
//! music-player title
//! music-player title --loop-at 5.0 --volume 0.5
//! music-player title --switch-to boss --switch-after 10 --fade-after 30 --duration 40
//! music-player path/to/track.ogg
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use music_stream::config;
use music_stream::{CpalDevice, MusicEngine, TrackId, TrackTable, VorbisLibrary};

/// 60 Hz
const TICK: Duration = Duration::from_micros(16_667);

/// Gain below which a fade counts as finished
const SILENCE: f32 = 1e-3;

#[derive(Parser)]
#[command(name = "music-player")]
#[command(author, version, about = "Streaming Ogg Vorbis music player")]
struct Args {
    /// Track name from the music table, or a path to an .ogg file
    track: Option<String>,

    /// Config file (default: music.toml in the platform config directory)
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the track table and exit
    #[arg(long, short = 'l')]
    list: bool,

    /// Loop point in seconds (default: the track's loop_start)
    #[arg(long, value_name = "SECS")]
    loop_at: Option<f64>,

    /// Initial gain (default: [stream] initial_volume)
    #[arg(long, short = 'v', value_name = "GAIN")]
    volume: Option<f32>,

    // === Track Switching ===
    /// Track to switch to from a second thread
    #[arg(long, value_name = "TRACK")]
    switch_to: Option<String>,

    /// Seconds before switching
    #[arg(long, value_name = "SECS", default_value = "10")]
    switch_after: f64,

    /// Start fading out after this many seconds
    #[arg(long, value_name = "SECS")]
    fade_after: Option<f64>,

    /// Stop after this many seconds (default: run until interrupted)
    #[arg(long, short = 'd', value_name = "SECS")]
    duration: Option<f64>,
}

/// Look `name` up in the table, or register it as a file path.
fn resolve(table: &mut TrackTable, name: &str) -> Result<TrackId> {
    if let Some(id) = table.id(name) {
        return Ok(id);
    }
    let path = Path::new(name);
    if path.is_file() {
        return Ok(table.insert(name, path, 0.0)?);
    }
    anyhow::bail!("Unknown track '{}' (use --list to see the track table)", name)
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {}: {}", flag, value))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => config::load_default(),
    };
    let mut table = TrackTable::from_config(&config).context("invalid track table")?;

    if args.list {
        if table.is_empty() {
            println!("No tracks configured");
        }
        for (id, name, path) in table.iter() {
            let loop_start = table.loop_start(id).unwrap_or(0.0);
            println!("{:>4}  {:<20} {} (loop at {:.2}s)", id, name, path.display(), loop_start);
        }
        return Ok(());
    }

    let Some(name) = args.track.as_deref() else {
        anyhow::bail!("No track given (use --list to see the track table)");
    };
    if args.volume.is_some_and(|v| !v.is_finite() || v < 0.0) {
        anyhow::bail!("Volume must be a non-negative number");
    }

    let track = resolve(&mut table, name)?;
    let loop_at = args
        .loop_at
        .or_else(|| table.loop_start(track))
        .unwrap_or(0.0);

    let switch = match args.switch_to.as_deref() {
        Some(target) => {
            let id = resolve(&mut table, target)?;
            let loop_start = table.loop_start(id).unwrap_or(0.0);
            Some((id, loop_start, seconds(args.switch_after, "--switch-after")?))
        }
        None => None,
    };
    let fade_after = args
        .fade_after
        .map(|s| seconds(s, "--fade-after"))
        .transpose()?;
    let duration = args
        .duration
        .map(|s| seconds(s, "--duration"))
        .transpose()?;

    let mut stream_config = config.stream.clone();
    if let Some(volume) = args.volume {
        stream_config.initial_volume = volume;
    }

    let device = CpalDevice::open(&config.device, stream_config.chunk_bytes)
        .context("failed to open audio output")?;
    let library = VorbisLibrary::new(table);
    let engine = Arc::new(MusicEngine::new(
        device,
        library,
        track,
        loop_at,
        &stream_config,
    )?);
    engine.play()?;
    info!("Playing '{}' (loop at {:.2}s)", name, loop_at);

    let switcher = switch
        .map(|(target, loop_start, delay)| {
            let engine = engine.clone();
            thread::Builder::new()
                .name("music-switch".into())
                .spawn(move || {
                    thread::sleep(delay);
                    match engine
                        .set_music(target, loop_start)
                        .and_then(|()| engine.play())
                    {
                        Ok(()) => info!("Switched to track {}", target),
                        Err(e) => error!("Track switch failed: {}", e),
                    }
                })
        })
        .transpose()
        .context("failed to spawn switch thread")?;

    let start = Instant::now();
    let mut next_tick = start;
    loop {
        let elapsed = start.elapsed();
        if duration.is_some_and(|d| elapsed >= d) {
            break;
        }
        if !engine.is_fading() && fade_after.is_some_and(|f| elapsed >= f) {
            info!("Fading out");
            engine.set_fade(true);
        }

        engine.update();

        if engine.is_fading() && engine.volume()? < SILENCE {
            info!("Fade complete");
            break;
        }

        next_tick += TICK;
        match next_tick.checked_duration_since(Instant::now()) {
            Some(wait) => thread::sleep(wait),
            // Fell behind; don't try to catch up
            None => next_tick = Instant::now(),
        }
    }

    if let Some(handle) = switcher {
        if handle.join().is_err() {
            warn!("Switch thread panicked");
        }
    }

    let metrics = engine.metrics();
    info!(
        "Stopped after {:.1}s: {} ticks, {} buffers requeued, {} loops, {} discarded, {} errors",
        start.elapsed().as_secs_f64(),
        metrics.ticks,
        metrics.requeued,
        metrics.loops,
        metrics.discarded,
        metrics.errors
    );
    Ok(())
}
