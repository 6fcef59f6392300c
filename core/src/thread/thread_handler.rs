use super::callback::Callback;
use crate::error::{Result, RsisError};

struct Scheduled {
    callback: Callback,
    divisor: u64,
}

/// Ordered callbacks ticked at a fixed rate on one OS thread
pub struct ThreadHandler {
    frequency: f64,
    callbacks: Vec<Scheduled>,
    tick: u64,
}

impl ThreadHandler {
    pub fn new(frequency: f64) -> Result<Self> {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(RsisError::InvalidFrequency(frequency));
        }
        Ok(Self {
            frequency,
            callbacks: Vec::new(),
            tick: 0,
        })
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn callback_names(&self) -> Vec<&str> {
        self.callbacks.iter().map(|s| s.callback.name()).collect()
    }

    /// Append a callback; it runs after every callback already present
    pub fn add_callback(&mut self, callback: Callback) -> Result<()> {
        let divisor = callback.divisor(self.frequency)?;
        log::debug!(
            "Callback '{}' scheduled every {} tick(s) at offset {}",
            callback.name(),
            divisor,
            callback.frame_offset()
        );
        self.callbacks.push(Scheduled { callback, divisor });
        Ok(())
    }

    /// Drop every callback called `name`, returning how many went
    pub fn remove_callbacks(&mut self, name: &str) -> usize {
        let before = self.callbacks.len();
        self.callbacks.retain(|s| s.callback.name() != name);
        before - self.callbacks.len()
    }

    /// Run the callbacks due this tick, stopping at the first failure
    pub fn execute_callbacks(&mut self) -> Result<()> {
        let tick = self.tick;
        self.tick += 1;
        for scheduled in &mut self.callbacks {
            if tick % scheduled.divisor == scheduled.callback.frame_offset() {
                scheduled.callback.call()?;
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.tick = 0;
    }
}

impl std::fmt::Debug for ThreadHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandler")
            .field("frequency", &self.frequency)
            .field("callbacks", &self.callback_names())
            .field("tick", &self.tick)
            .finish()
    }
}
