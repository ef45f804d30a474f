//! Progress, smoothed throughput and ETA, shared by both directions.

use super::constants::{SAMPLE_INTERVAL, SPEED_WINDOW};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub bytes_per_sec: f64,
    /// None until there is a non-zero rate to extrapolate from
    pub eta: Option<Duration>,
}

/// Rolling window of (time, bytes) points, sampled at most every 0.5 s.
pub struct ThroughputMeter {
    total: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(total: u64, now: Instant) -> Self {
        let mut samples = VecDeque::with_capacity(SPEED_WINDOW);
        samples.push_back((now, 0));
        Self { total, samples }
    }

    /// Feed the running byte count. Returns a fresh sample when one is due;
    /// the final byte always produces one.
    pub fn record(&mut self, transferred: u64, now: Instant) -> Option<SpeedSample> {
        let (last_at, _) = *self.samples.back()?;
        let finished = transferred >= self.total;
        if !finished && now.saturating_duration_since(last_at) < SAMPLE_INTERVAL {
            return None;
        }

        self.samples.push_back((now, transferred));
        while self.samples.len() > SPEED_WINDOW {
            self.samples.pop_front();
        }

        let (first_at, first_bytes) = *self.samples.front()?;
        let elapsed = now.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let bytes_per_sec = transferred.saturating_sub(first_bytes) as f64 / elapsed;
        let remaining = self.total.saturating_sub(transferred);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if bytes_per_sec > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / bytes_per_sec).ok()
        } else {
            None
        };

        Some(SpeedSample { bytes_per_sec, eta })
    }
}

/// Percentage in 0..=100; an empty file counts as done.
pub fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).min(100.0) as f32
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec > 1_000.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "Calculating...".to_string();
    };
    let secs = eta.as_secs();
    if secs == 0 {
        "Done".to_string()
    } else if secs < 60 {
        format!("{}s left", secs)
    } else {
        format!("{}m {}s left", secs / 60, secs % 60)
    }
}
