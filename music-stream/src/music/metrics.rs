//! Stream health monitoring and diagnostics

use std::time::{Duration, Instant};

use tracing::debug;

const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Counters fed by `MusicEngine::update`.
///
/// Totals are kept for the engine's lifetime; the per-interval counters
/// reset each time a line is logged.
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    /// Total `update()` calls
    pub ticks: u64,
    /// Buffers refilled and handed back to the device
    pub requeued: u64,
    /// Buffers dropped because the track changed mid-decode
    pub discarded: u64,
    /// Times the stream ran out and was seeked to the loop point
    pub loops: u64,
    /// Device or decoder errors swallowed by the tick path
    pub errors: u64,
    interval_ticks: u64,
    interval_requeued: u64,
    interval_errors: u64,
    last_log_time: Instant,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            ticks: 0,
            requeued: 0,
            discarded: 0,
            loops: 0,
            errors: 0,
            interval_ticks: 0,
            interval_requeued: 0,
            interval_errors: 0,
            last_log_time: Instant::now(),
        }
    }

    pub(super) fn record_tick(&mut self) {
        self.ticks += 1;
        self.interval_ticks += 1;
    }

    pub(super) fn record_requeue(&mut self) {
        self.requeued += 1;
        self.interval_requeued += 1;
    }

    pub(super) fn record_discard(&mut self) {
        self.discarded += 1;
    }

    pub(super) fn record_loop(&mut self) {
        self.loops += 1;
    }

    pub(super) fn record_error(&mut self) {
        self.errors += 1;
        self.interval_errors += 1;
    }

    /// Log metrics if enough time has passed (every 1 second)
    pub(super) fn maybe_log(&mut self) {
        if self.last_log_time.elapsed() < LOG_INTERVAL {
            return;
        }

        debug!(
            "MUSIC METRICS: ticks={}, requeued={}, errors={} (totals: discarded={}, loops={}, errors={})",
            self.interval_ticks,
            self.interval_requeued,
            self.interval_errors,
            self.discarded,
            self.loops,
            self.errors
        );

        self.interval_ticks = 0;
        self.interval_requeued = 0;
        self.interval_errors = 0;
        self.last_log_time = Instant::now();
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_survive_interval_reset() {
        let mut metrics = StreamMetrics::new();
        metrics.record_tick();
        metrics.record_requeue();
        metrics.record_error();
        metrics.last_log_time = Instant::now() - LOG_INTERVAL;
        metrics.maybe_log();

        assert_eq!(metrics.interval_ticks, 0);
        assert_eq!(metrics.interval_requeued, 0);
        assert_eq!(metrics.ticks, 1);
        assert_eq!(metrics.requeued, 1);
        assert_eq!(metrics.errors, 1);
    }
}
