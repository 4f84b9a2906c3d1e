//! Windowed hashrate averages.
//!
//! The search loop feeds target-check deltas in as they are sampled. Once a
//! minute the accumulated count becomes a one-minute rate which, if
//! plausible, joins two history windows (10 and 60 minutes).

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const SHORT_WINDOW: usize = 10;
const LONG_WINDOW: usize = 60;

/// One-minute samples outside this open interval (MH/s) are treated as
/// transient garbage and kept out of the history.
const PLAUSIBLE_MHS: (f64, f64) = (10.0, 100.0);

/// Latest averages, all in MH/s except the error rate (percent).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashrateAverages {
    pub one_minute: f64,
    pub ten_minute: f64,
    pub sixty_minute: f64,
    pub error_rate_pct: f64,
}

#[derive(Debug)]
pub struct HashrateAverager {
    counter: u64,
    last_flush: Instant,
    short: VecDeque<f64>,
    long: VecDeque<f64>,
    latest: HashrateAverages,
}

impl HashrateAverager {
    pub fn new(now: Instant) -> Self {
        Self {
            counter: 0,
            last_flush: now,
            short: VecDeque::with_capacity(SHORT_WINDOW + 1),
            long: VecDeque::with_capacity(LONG_WINDOW + 1),
            latest: HashrateAverages::default(),
        }
    }

    /// Add a target-check delta. Returns fresh averages when a minute has
    /// passed since the last flush.
    ///
    /// `error_rate` is the tuner's hardware error fraction (0.0..=1.0).
    pub fn record(&mut self, delta: u64, now: Instant, error_rate: f64) -> Option<HashrateAverages> {
        self.counter = self.counter.saturating_add(delta);

        if now.saturating_duration_since(self.last_flush) < FLUSH_INTERVAL {
            return None;
        }

        let one_minute = self.counter as f64 / 60.0 / 1_000_000.0;
        if one_minute > PLAUSIBLE_MHS.0 && one_minute < PLAUSIBLE_MHS.1 {
            push_bounded(&mut self.short, one_minute, SHORT_WINDOW);
            push_bounded(&mut self.long, one_minute, LONG_WINDOW);
        }

        self.latest = HashrateAverages {
            one_minute,
            ten_minute: mean(&self.short),
            sixty_minute: mean(&self.long),
            error_rate_pct: error_rate * 100.0,
        };
        self.counter = 0;
        self.last_flush = now;
        Some(self.latest)
    }

    pub fn latest(&self) -> HashrateAverages {
        self.latest
    }

    pub fn history_len(&self) -> (usize, usize) {
        (self.short.len(), self.long.len())
    }
}

fn push_bounded(window: &mut VecDeque<f64>, sample: f64, cap: usize) {
    window.push_back(sample);
    while window.len() > cap {
        window.pop_front();
    }
}

fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().sum::<f64>() / window.len() as f64
}
