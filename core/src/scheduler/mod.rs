use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::error::{Result, RsisError};
use crate::thread::Callback;

mod nrt;
mod time;

pub use nrt::NrtScheduler;
pub use time::{Time, TimeManager};

/// Control-surface id of the non real-time scheduler
pub const NRT_SCHEDULER: u32 = 0;

/// Build the scheduler a control-surface id names
pub fn by_id(id: u32, frequency: f64, epoch_duration: Option<f64>) -> Result<Box<dyn Scheduler>> {
    match id {
        NRT_SCHEDULER => {
            let mut scheduler = NrtScheduler::new(frequency)?;
            if let Some(duration) = epoch_duration {
                scheduler.set_epoch_duration(duration)?;
            }
            Ok(Box::new(scheduler))
        }
        other => Err(RsisError::InvalidArgument(format!("no scheduler with id {}", other))),
    }
}

/// Outcome of one scheduling pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    /// Scheduler ticks executed during the pass
    pub ticks: u64,
    pub reason: StopReason,
    pub time: Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The tick limit was reached
    Limit,
    /// The halt flag was raised
    Halted,
}

/// Drives thread handlers against a shared simulated clock
pub trait Scheduler: Send {
    fn description(&self) -> &str;

    /// Base tick rate
    fn frequency(&self) -> f64;

    fn set_frequency(&mut self, frequency: f64) -> Result<()>;

    fn set_epoch_duration(&mut self, duration: f64) -> Result<()>;

    /// Create a handler and return its index. Indices are never reused.
    fn create_thread_handler(&mut self, frequency: f64) -> Result<usize>;

    fn add_callback(&mut self, thread: usize, callback: Callback) -> Result<()>;

    /// Remove every callback named `name` from every handler
    fn remove_callbacks(&mut self, name: &str) -> usize;

    /// Remove every handler and its callbacks
    fn drop_threads(&mut self);

    fn thread_count(&self) -> usize;

    /// Check readiness and reset simulated time
    fn init(&mut self) -> Result<()>;

    /// Execute ticks until `limit` is reached, `halt` is raised, or a
    /// callback fails. A failure ends the pass after the current tick.
    fn run(&mut self, limit: Option<u64>, halt: &AtomicBool) -> Result<RunReport>;

    fn time(&self) -> Time;

    /// Shared clock, readable while a pass holds the scheduler
    fn clock(&self) -> Arc<Mutex<TimeManager>>;
}
