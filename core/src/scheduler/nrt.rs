use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, PoisonError};
use std::thread;

use super::{RunReport, Scheduler, StopReason, Time, TimeManager};
use crate::error::{Result, RsisError};
use crate::thread::{integer_ratio, Callback, ThreadHandler};

const DESCRIPTION: &str = "Non Real-Time Scheduler.";

struct Slot {
    handler: ThreadHandler,
    /// Scheduler ticks per handler tick
    divisor: u64,
}

/// Holds spawned workers until the whole set is up, or sends them home
#[derive(Default)]
struct StartGate {
    open: Mutex<Option<bool>>,
    signal: Condvar,
}

impl StartGate {
    fn release(&self, go: bool) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = Some(go);
        self.signal.notify_all();
    }

    fn wait(&self) -> bool {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(go) = *open {
                return go;
            }
            open = self.signal.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
thread_local! {
    static REFUSED_SPAWN: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Fails the spawn of one handler thread in tests
#[cfg(test)]
fn spawn_refused(index: usize) -> bool {
    REFUSED_SPAWN.with(|r| r.get() == Some(index))
}

#[cfg(not(test))]
fn spawn_refused(_index: usize) -> bool {
    false
}

/// Runs handlers in lockstep as fast as the host allows.
///
/// Each pass spawns one scoped thread per handler. All threads meet at a
/// barrier twice per scheduler tick: once to agree whether to continue, once
/// to release the tick. The barrier leader advances the clock.
pub struct NrtScheduler {
    clock: Arc<Mutex<TimeManager>>,
    threads: BTreeMap<usize, Slot>,
    next_index: usize,
    tick: u64,
}

impl NrtScheduler {
    pub fn new(frequency: f64) -> Result<Self> {
        Ok(Self {
            clock: Arc::new(Mutex::new(TimeManager::with_frequency(frequency)?)),
            threads: BTreeMap::new(),
            next_index: 0,
            tick: 0,
        })
    }

    fn lock_clock(&self) -> std::sync::MutexGuard<'_, TimeManager> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_idle(&mut self, limit: Option<u64>, halt: &AtomicBool) -> RunReport {
        let mut ticks = 0;
        let reason = loop {
            if limit.is_some_and(|l| ticks >= l) {
                break StopReason::Limit;
            }
            if halt.load(Ordering::Acquire) {
                break StopReason::Halted;
            }
            self.lock_clock().increment();
            ticks += 1;
        };
        self.tick += ticks;
        RunReport {
            ticks,
            reason,
            time: self.time(),
        }
    }
}

impl Scheduler for NrtScheduler {
    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn frequency(&self) -> f64 {
        self.lock_clock().frequency()
    }

    fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        for slot in self.threads.values() {
            integer_ratio(frequency, slot.handler.frequency())?;
        }
        self.lock_clock().set_frequency(frequency)?;
        let divisors: Vec<(usize, u64)> = self
            .threads
            .iter()
            .map(|(i, s)| (*i, integer_ratio(frequency, s.handler.frequency()).unwrap_or(1)))
            .collect();
        for (index, divisor) in divisors {
            if let Some(slot) = self.threads.get_mut(&index) {
                slot.divisor = divisor;
            }
        }
        Ok(())
    }

    fn set_epoch_duration(&mut self, duration: f64) -> Result<()> {
        self.lock_clock().set_epoch_duration(duration)
    }

    fn create_thread_handler(&mut self, frequency: f64) -> Result<usize> {
        let handler = ThreadHandler::new(frequency)?;
        let divisor = integer_ratio(self.frequency(), frequency)?;
        let index = self.next_index;
        self.next_index += 1;
        self.threads.insert(index, Slot { handler, divisor });
        log::info!("Created thread {} at {} Hz", index, frequency);
        Ok(index)
    }

    fn add_callback(&mut self, thread: usize, callback: Callback) -> Result<()> {
        self.threads
            .get_mut(&thread)
            .ok_or(RsisError::UnknownThread(thread))?
            .handler
            .add_callback(callback)
    }

    fn remove_callbacks(&mut self, name: &str) -> usize {
        self.threads
            .values_mut()
            .map(|slot| slot.handler.remove_callbacks(name))
            .sum()
    }

    fn drop_threads(&mut self) {
        if !self.threads.is_empty() {
            log::info!("Dropping {} thread(s)", self.threads.len());
        }
        self.threads.clear();
    }

    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn init(&mut self) -> Result<()> {
        self.lock_clock().reset();
        self.tick = 0;
        for slot in self.threads.values_mut() {
            slot.handler.reset();
        }
        log::debug!("{} ready with {} thread(s)", DESCRIPTION, self.threads.len());
        Ok(())
    }

    fn run(&mut self, limit: Option<u64>, halt: &AtomicBool) -> Result<RunReport> {
        if self.threads.is_empty() {
            return Ok(self.run_idle(limit, halt));
        }

        let start = self.tick;
        let barrier = Barrier::new(self.threads.len());
        let stop = AtomicBool::new(false);
        let ticks = AtomicU64::new(0);
        let failure: Mutex<Option<RsisError>> = Mutex::new(None);
        let reason: Mutex<StopReason> = Mutex::new(StopReason::Limit);
        let clock = &self.clock;

        let gate = StartGate::default();

        thread::scope(|s| {
            let mut refused = None;
            for (index, slot) in self.threads.iter_mut() {
                let (barrier, stop, ticks, failure, reason, gate) =
                    (&barrier, &stop, &ticks, &failure, &reason, &gate);
                let spawned = if spawn_refused(*index) {
                    Err(io::Error::other("spawn refused"))
                } else {
                    thread::Builder::new()
                        .name(format!("rsis-thread-{}", index))
                        .spawn_scoped(s, move || {
                            if !gate.wait() {
                                return;
                            }
                            let mut first = true;
                            loop {
                                if barrier.wait().is_leader() {
                                    if !first {
                                        clock.lock().unwrap_or_else(PoisonError::into_inner).increment();
                                        ticks.fetch_add(1, Ordering::AcqRel);
                                    }
                                    let done = ticks.load(Ordering::Acquire);
                                    let failed = failure
                                        .lock()
                                        .unwrap_or_else(PoisonError::into_inner)
                                        .is_some();
                                    if failed || limit.is_some_and(|l| done >= l) {
                                        stop.store(true, Ordering::Release);
                                    } else if halt.load(Ordering::Acquire) {
                                        *reason.lock().unwrap_or_else(PoisonError::into_inner) =
                                            StopReason::Halted;
                                        stop.store(true, Ordering::Release);
                                    }
                                }
                                first = false;
                                barrier.wait();
                                if stop.load(Ordering::Acquire) {
                                    break;
                                }

                                let tick = start + ticks.load(Ordering::Acquire);
                                if tick % slot.divisor == 0 {
                                    let result = catch_unwind(AssertUnwindSafe(|| {
                                        slot.handler.execute_callbacks()
                                    }))
                                    .unwrap_or_else(|_| {
                                        Err(RsisError::Command(format!("thread {} panicked", index)))
                                    });
                                    if let Err(e) = result {
                                        log::error!("Thread {} failed at tick {}: {}", index, tick, e);
                                        failure
                                            .lock()
                                            .unwrap_or_else(PoisonError::into_inner)
                                            .get_or_insert(e);
                                    }
                                }
                            }
                        })
                        .map(|_| ())
                };
                if let Err(e) = spawned {
                    refused = Some(RsisError::Command(format!(
                        "failed to spawn thread {}: {}",
                        index, e
                    )));
                    break;
                }
            }

            // Workers only touch the barrier once every one of them exists
            match refused {
                Some(e) => {
                    log::error!("{}", e);
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                    gate.release(false);
                }
                None => gate.release(true),
            }
        });

        let ticks = ticks.into_inner();
        self.tick += ticks;
        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        Ok(RunReport {
            ticks,
            reason: reason.into_inner().unwrap_or_else(PoisonError::into_inner),
            time: self.time(),
        })
    }

    fn time(&self) -> Time {
        self.lock_clock().time()
    }

    fn clock(&self) -> Arc<Mutex<TimeManager>> {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(count: &Arc<AtomicUsize>, frequency: f64) -> Callback {
        let count = count.clone();
        Callback::new("count", frequency, 0, move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_description() {
        let s = NrtScheduler::new(1.0).unwrap();
        assert_eq!(s.description(), "Non Real-Time Scheduler.");
    }

    #[test]
    fn test_indices_are_not_reused() {
        let mut s = NrtScheduler::new(10.0).unwrap();
        assert_eq!(s.create_thread_handler(10.0).unwrap(), 0);
        assert_eq!(s.create_thread_handler(5.0).unwrap(), 1);
        s.drop_threads();
        s.drop_threads();
        assert_eq!(s.thread_count(), 0);
        assert_eq!(s.create_thread_handler(1.0).unwrap(), 2);
        assert!(matches!(
            s.add_callback(0, counter(&Arc::new(AtomicUsize::new(0)), 1.0)),
            Err(RsisError::UnknownThread(0))
        ));
    }

    #[test]
    fn test_thread_frequency_must_divide() {
        let mut s = NrtScheduler::new(10.0).unwrap();
        assert!(s.create_thread_handler(3.0).is_err());
        assert!(s.create_thread_handler(20.0).is_err());
        assert_eq!(s.thread_count(), 0);
    }

    #[test]
    fn test_run_limit_lockstep() {
        let mut s = NrtScheduler::new(10.0).unwrap();
        let fast = s.create_thread_handler(10.0).unwrap();
        let slow = s.create_thread_handler(2.0).unwrap();
        let fast_count = Arc::new(AtomicUsize::new(0));
        let slow_count = Arc::new(AtomicUsize::new(0));
        s.add_callback(fast, counter(&fast_count, 10.0)).unwrap();
        s.add_callback(slow, counter(&slow_count, 2.0)).unwrap();
        s.init().unwrap();

        let halt = AtomicBool::new(false);
        let report = s.run(Some(20), &halt).unwrap();
        assert_eq!(report.ticks, 20);
        assert_eq!(report.reason, StopReason::Limit);
        assert_eq!(fast_count.load(Ordering::SeqCst), 20);
        assert_eq!(slow_count.load(Ordering::SeqCst), 4);
        assert_eq!(report.time.step, 20);
        assert!((report.time.time - 2.0).abs() < 1e-9);

        // A second pass continues where the first stopped
        let report = s.run(Some(5), &halt).unwrap();
        assert_eq!(report.time.step, 25);
        assert_eq!(slow_count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_halt_stops_pass() {
        let mut s = NrtScheduler::new(100.0).unwrap();
        let t = s.create_thread_handler(100.0).unwrap();
        let halt = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicUsize::new(0));
        let (h, c) = (halt.clone(), seen.clone());
        s.add_callback(
            t,
            Callback::new("halter", 100.0, 0, move || {
                if c.fetch_add(1, Ordering::SeqCst) == 9 {
                    h.store(true, Ordering::SeqCst);
                }
                Ok(())
            }),
        )
        .unwrap();
        s.init().unwrap();

        let report = s.run(None, &halt).unwrap();
        assert_eq!(report.reason, StopReason::Halted);
        assert_eq!(report.ticks, 10);
    }

    #[test]
    fn test_failure_ends_pass_after_tick() {
        let mut s = NrtScheduler::new(1.0).unwrap();
        let a = s.create_thread_handler(1.0).unwrap();
        let b = s.create_thread_handler(1.0).unwrap();
        let other = Arc::new(AtomicUsize::new(0));
        let mut calls = 0;
        s.add_callback(
            a,
            Callback::new("flaky", 1.0, 0, move || {
                calls += 1;
                if calls == 3 {
                    Err(RsisError::Command("flaky".into()))
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();
        s.add_callback(b, counter(&other, 1.0)).unwrap();
        s.init().unwrap();

        let err = s.run(Some(100), &AtomicBool::new(false)).unwrap_err();
        assert_eq!(err, RsisError::Command("flaky".into()));
        assert_eq!(other.load(Ordering::SeqCst), 3);
        assert_eq!(s.time().step, 3);
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let mut s = NrtScheduler::new(10.0).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let t = s.create_thread_handler(10.0).unwrap();
            s.add_callback(t, counter(&count, 10.0)).unwrap();
        }
        s.init().unwrap();

        REFUSED_SPAWN.with(|r| r.set(Some(1)));
        let err = s.run(Some(10), &AtomicBool::new(false)).unwrap_err();
        REFUSED_SPAWN.with(|r| r.set(None));
        assert!(matches!(err, RsisError::Command(ref m) if m.contains("spawn thread 1")));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(s.time().step, 0);

        // Nothing is left waiting, so the next pass runs normally
        let report = s.run(Some(2), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.ticks, 2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_idle_pass_advances_time() {
        let mut s = NrtScheduler::new(4.0).unwrap();
        s.init().unwrap();
        let report = s.run(Some(8), &AtomicBool::new(false)).unwrap();
        assert_eq!(report.ticks, 8);
        assert!((report.time.time - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_init_resets_time() {
        let mut s = NrtScheduler::new(4.0).unwrap();
        s.run(Some(3), &AtomicBool::new(false)).unwrap();
        s.init().unwrap();
        assert_eq!(s.time(), Time::default());
    }
}
