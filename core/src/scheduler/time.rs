use crate::error::{Result, RsisError};

/// Snapshot of simulated time
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
pub struct Time {
    pub step: i64,
    pub epoch: i64,
    /// Seconds elapsed within the current epoch
    pub time: f64,
}

/// Fixed-rate simulated clock with epoch wraparound.
///
/// Elapsed time is always derived from the step count rather than summed,
/// so rounding error does not accumulate over long runs.
#[derive(Debug, Clone)]
pub struct TimeManager {
    time: Time,
    frequency: f64,
    delta: f64,
    epoch_duration: f64,
    /// Total seconds removed by epoch wraps so far
    wrapped: f64,
    /// Elapsed seconds and step at the last frequency change
    origin_elapsed: f64,
    origin_step: i64,
}

impl Default for TimeManager {
    fn default() -> Self {
        Self {
            time: Time::default(),
            frequency: 1.0,
            delta: 1.0,
            epoch_duration: f64::INFINITY,
            wrapped: 0.0,
            origin_elapsed: 0.0,
            origin_step: 0,
        }
    }
}

impl TimeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frequency(frequency: f64) -> Result<Self> {
        let mut tm = Self::new();
        tm.set_frequency(frequency)?;
        Ok(tm)
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn epoch_duration(&self) -> f64 {
        self.epoch_duration
    }

    pub fn time(&self) -> Time {
        self.time
    }

    /// Change the tick rate. Time already elapsed is kept.
    pub fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(RsisError::InvalidFrequency(frequency));
        }
        let delta = 1.0 / frequency;
        if delta > self.epoch_duration {
            return Err(RsisError::InvalidFrequency(frequency));
        }
        self.origin_elapsed = self.elapsed();
        self.origin_step = self.time.step;
        self.frequency = frequency;
        self.delta = delta;
        Ok(())
    }

    pub fn set_epoch_duration(&mut self, duration: f64) -> Result<()> {
        if duration.is_nan() || duration <= 0.0 || duration < self.delta {
            return Err(RsisError::InvalidEpochDuration(duration));
        }
        self.epoch_duration = duration;
        Ok(())
    }

    /// Advance one step, wrapping into the next epoch when needed
    pub fn increment(&mut self) {
        self.time.step += 1;
        let mut time = self.elapsed() - self.wrapped;
        if time > self.epoch_duration {
            self.time.epoch += 1;
            self.wrapped += self.epoch_duration;
            time -= self.epoch_duration;
        }
        self.time.time = time;
    }

    pub fn reset(&mut self) {
        self.time = Time::default();
        self.wrapped = 0.0;
        self.origin_elapsed = 0.0;
        self.origin_step = 0;
    }

    fn elapsed(&self) -> f64 {
        self.origin_elapsed + self.delta * (self.time.step - self.origin_step) as f64
    }
}
