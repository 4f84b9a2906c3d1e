//! Interface to the auto-tuning policy.
//!
//! The policy itself lives outside the driver. The driver asks it for
//! intensity overrides, feeds it hash counts and tells it when the clock
//! settles after a DAG rebuild.

use std::path::Path;
use std::sync::Mutex;

use crate::types::IntensitySettings;

pub trait AutoTuner: Send + Sync {
    /// Intensity to program for the next search, if the tuner wants to
    /// override the configured one.
    fn intensity_override(&self) -> Option<IntensitySettings>;

    /// Feedback: target checks completed since the last call.
    fn tune(&self, hash_delta: u64);

    /// Fraction of hardware results that failed verification.
    fn error_rate(&self) -> f64;

    /// Non-zero while a tuning run is in progress.
    fn tuning_stage(&self) -> u8;

    /// (Re)start tuning at the given core clock.
    fn start_tune(&self, clock_mhz: f64);

    /// Load previously saved settings for `calibration_id`. Returns whether
    /// an entry was found and applied.
    fn load_saved(&self, tune_file: &Path, calibration_id: &str) -> bool;
}

/// Tuner that never overrides anything.
#[derive(Debug, Default)]
pub struct FixedTuning;

impl AutoTuner for FixedTuning {
    fn intensity_override(&self) -> Option<IntensitySettings> {
        None
    }

    fn tune(&self, _hash_delta: u64) {}

    fn error_rate(&self) -> f64 {
        0.0
    }

    fn tuning_stage(&self) -> u8 {
        0
    }

    fn start_tune(&self, _clock_mhz: f64) {}

    fn load_saved(&self, _tune_file: &Path, _calibration_id: &str) -> bool {
        false
    }
}

/// Records every call; used to assert on driver/tuner interaction.
#[derive(Debug, Default)]
pub struct RecordingTuner {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub override_with: Option<IntensitySettings>,
    pub deltas: Vec<u64>,
    pub starts: Vec<f64>,
    pub loads: Vec<String>,
    pub saved_hit: bool,
    pub error_rate: f64,
    pub stage: u8,
}

impl RecordingTuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(intensity: IntensitySettings) -> Self {
        let tuner = Self::default();
        tuner.lock().override_with = Some(intensity);
        tuner
    }

    pub fn with_saved_tune() -> Self {
        let tuner = Self::default();
        tuner.lock().saved_hit = true;
        tuner
    }

    pub fn recorded(&self) -> Recorded {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AutoTuner for RecordingTuner {
    fn intensity_override(&self) -> Option<IntensitySettings> {
        self.lock().override_with
    }

    fn tune(&self, hash_delta: u64) {
        self.lock().deltas.push(hash_delta);
    }

    fn error_rate(&self) -> f64 {
        self.lock().error_rate
    }

    fn tuning_stage(&self) -> u8 {
        self.lock().stage
    }

    fn start_tune(&self, clock_mhz: f64) {
        self.lock().starts.push(clock_mhz);
    }

    fn load_saved(&self, _tune_file: &Path, calibration_id: &str) -> bool {
        let mut r = self.lock();
        r.loads.push(calibration_id.to_string());
        r.saved_hit
    }
}
