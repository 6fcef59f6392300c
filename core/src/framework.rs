use rsis_model_abi::{ConfigStatus, PluginEntryPoints};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::ChannelRegistry;
use crate::connection::Connection;
use crate::error::{Result, RsisError};
use crate::library::LibraryManager;
use crate::model::ModelInstance;
use crate::registration::{ModelReflection, ModelRegistration};
use crate::scheduler::{NrtScheduler, Scheduler, StopReason, Time, TimeManager};
use crate::thread::Callback;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameworkState {
    NoState = 0,
    Config = 1,
    Init = 2,
    Ready = 3,
    Pause = 4,
    Run = 5,
    End = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Init,
    Run,
    Step(u64),
    Pause,
    End,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Run => "run",
            Command::Step(_) => "step",
            Command::Pause => "pause",
            Command::End => "end",
        }
    }

    /// Commands that stop a pass in progress
    fn halts(&self) -> bool {
        matches!(self, Command::Pause | Command::End)
    }
}

/// State the runner reaches once `command` succeeds from `state`, `None`
/// when the command is not accepted there
fn next_state(state: FrameworkState, command: Command) -> Option<FrameworkState> {
    use FrameworkState::*;
    match (command, state) {
        (Command::Init, Config) => Some(Ready),
        (Command::Run, Ready | Pause) => Some(Run),
        (Command::Step(_), Ready | Pause) => Some(Pause),
        (Command::Pause, Run | Pause) => Some(Pause),
        (Command::End, Config | Init | Ready | Pause | Run) => Some(End),
        _ => None,
    }
}

/// Settings fixed when the framework is created
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Scheduler base rate in Hz
    pub frequency: f64,
    pub epoch_duration: Option<f64>,
    /// Simulated seconds after which `run` ends the simulation
    pub end_time: Option<f64>,
    /// Upper bound on blocking command waits
    pub handshake_timeout: Option<Duration>,
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            frequency: 1.0,
            epoch_duration: None,
            end_time: None,
            handshake_timeout: None,
            plugin_dirs: Vec::new(),
        }
    }
}

/// State shared between callers and the runner, guarded by one mutex
struct Handshake {
    state: FrameworkState,
    queue: VecDeque<(u64, Command)>,
    /// Sequence number of the last enqueued command
    issued: u64,
    /// Sequence number of the last command the runner finished
    completed: u64,
    /// Commands someone is blocked on; only these keep their failure
    waiters: HashSet<u64>,
    failures: HashMap<u64, RsisError>,
    message: String,
    runner_alive: bool,
    /// Set once shutdown starts; no command is accepted afterwards
    closing: bool,
}

impl Handshake {
    /// The state the runner will be in after draining the queue
    fn projected(&self) -> FrameworkState {
        let start = match self.state {
            FrameworkState::Init => FrameworkState::Ready,
            state => state,
        };
        self.queue
            .iter()
            .fold(start, |state, (_, command)| next_state(state, *command).unwrap_or(state))
    }

    fn transition(&mut self, state: FrameworkState) {
        if self.state != state {
            log::info!("Framework state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

struct Shared {
    handshake: Mutex<Handshake>,
    signal: Condvar,
    halt: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Handshake> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FrameworkState) {
        self.lock().transition(state);
        self.signal.notify_all();
    }
}

/// Control-plane tables
#[derive(Default)]
struct Core {
    libraries: LibraryManager,
    registration: ModelRegistration,
}

type SharedScheduler = Arc<Mutex<Box<dyn Scheduler>>>;

/// Owns the scheduler, the plugin tables and the runner thread.
///
/// Lifecycle commands are checked against the state the runner will be in
/// once its queue drains, then queued with a sequence number and
/// acknowledged over a condition variable. The scheduler mutex is held by the
/// runner for a whole pass, so simulated time is read through the shared
/// clock instead.
pub struct Framework {
    shared: Arc<Shared>,
    runner: Mutex<Option<JoinHandle<()>>>,
    core: Arc<Mutex<Core>>,
    scheduler: SharedScheduler,
    clock: Mutex<Arc<Mutex<TimeManager>>>,
    scheduler_name: Mutex<String>,
    channels: ChannelRegistry,
    config: FrameworkConfig,
}

impl Framework {
    pub fn new(config: FrameworkConfig) -> Result<Self> {
        let mut scheduler = NrtScheduler::new(config.frequency)?;
        if let Some(duration) = config.epoch_duration {
            scheduler.set_epoch_duration(duration)?;
        }
        if let Some(end) = config.end_time {
            if !end.is_finite() || end < 0.0 {
                return Err(RsisError::InvalidArgument(format!("end time {}", end)));
            }
        }
        let clock = scheduler.clock();
        let scheduler_name = scheduler.description().to_string();

        let mut libraries = LibraryManager::new();
        for dir in config.plugin_dirs.iter().rev() {
            libraries.add_search_dir(dir.clone());
        }

        log::info!("Framework created with {} at {} Hz", scheduler_name, config.frequency);
        Ok(Self {
            shared: Arc::new(Shared {
                handshake: Mutex::new(Handshake {
                    state: FrameworkState::Config,
                    queue: VecDeque::new(),
                    issued: 0,
                    completed: 0,
                    waiters: HashSet::new(),
                    failures: HashMap::new(),
                    message: String::new(),
                    runner_alive: false,
                    closing: false,
                }),
                signal: Condvar::new(),
                halt: AtomicBool::new(false),
            }),
            runner: Mutex::new(None),
            core: Arc::new(Mutex::new(Core {
                libraries,
                registration: ModelRegistration::new(),
            })),
            scheduler: Arc::new(Mutex::new(Box::new(scheduler))),
            clock: Mutex::new(clock),
            scheduler_name: Mutex::new(scheduler_name),
            channels: ChannelRegistry::new(),
            config,
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn state(&self) -> FrameworkState {
        self.shared.lock().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() != FrameworkState::NoState
    }

    /// Last error or status text reported by the runner or a failed call
    pub fn message(&self) -> String {
        self.shared.lock().message.clone()
    }

    pub fn scheduler_name(&self) -> String {
        self.scheduler_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn time(&self) -> Time {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let time = clock.lock().unwrap_or_else(PoisonError::into_inner).time();
        time
    }

    /// Byte channels shared with models; see `Channels` in the model helper
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler(&self) -> MutexGuard<'_, Box<dyn Scheduler>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.shared.lock().message = e.to_string();
        }
        result
    }

    fn require(&self, command: &'static str, allowed: &[FrameworkState]) -> Result<()> {
        let state = self.state();
        if state == FrameworkState::NoState {
            return Err(RsisError::NotAlive);
        }
        if !allowed.contains(&state) {
            return Err(RsisError::InvalidTransition { command, state });
        }
        Ok(())
    }

    // --- LIFECYCLE COMMANDS ---

    pub fn init_scheduler(&self, block: bool) -> Result<()> {
        self.submit(Command::Init, block)
    }

    pub fn run_scheduler(&self, block: bool) -> Result<()> {
        self.submit(Command::Run, block)
    }

    /// Run exactly `steps` scheduler ticks, then pause
    pub fn step_scheduler(&self, steps: u64, block: bool) -> Result<()> {
        self.submit(Command::Step(steps), block)
    }

    pub fn pause_scheduler(&self, block: bool) -> Result<()> {
        self.submit(Command::Pause, block)
    }

    pub fn end_scheduler(&self, block: bool) -> Result<()> {
        self.submit(Command::End, block)
    }

    fn submit(&self, command: Command, block: bool) -> Result<()> {
        let result = self.enqueue(command, block).and_then(|seq| match seq {
            Some(seq) => self.wait_for(seq),
            None => Ok(()),
        });
        self.record(result)
    }

    fn enqueue(&self, command: Command, block: bool) -> Result<Option<u64>> {
        let mut hs = self.shared.lock();
        if hs.state == FrameworkState::NoState || hs.closing {
            return Err(RsisError::NotAlive);
        }
        let projected = hs.projected();
        if next_state(projected, command).is_none() {
            return Err(RsisError::InvalidTransition {
                command: command.name(),
                state: projected,
            });
        }
        // Only the runner lowers the flag, when it starts a pass
        if command.halts() {
            self.shared.halt.store(true, Ordering::Release);
        }

        hs.issued += 1;
        let seq = hs.issued;
        hs.queue.push_back((seq, command));
        if block {
            hs.waiters.insert(seq);
        }
        log::debug!("Queued {} command #{}", command.name(), seq);

        // Spawned under the handshake lock so shutdown always finds the handle
        if !hs.runner_alive {
            if let Err(e) = self.spawn_runner() {
                hs.queue.pop_back();
                hs.waiters.remove(&seq);
                return Err(e);
            }
            hs.runner_alive = true;
        }
        drop(hs);
        self.shared.signal.notify_all();
        Ok(block.then_some(seq))
    }

    fn wait_for(&self, seq: u64) -> Result<()> {
        let deadline = self.config.handshake_timeout.map(|t| Instant::now() + t);
        let mut hs = self.shared.lock();
        loop {
            if let Some(e) = hs.failures.remove(&seq) {
                hs.waiters.remove(&seq);
                return Err(e);
            }
            if hs.completed >= seq {
                hs.waiters.remove(&seq);
                return Ok(());
            }
            if !hs.runner_alive {
                hs.waiters.remove(&seq);
                return Err(RsisError::RunnerGone);
            }
            hs = match deadline {
                None => self
                    .shared
                    .signal
                    .wait(hs)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        hs.waiters.remove(&seq);
                        Self::withdraw(&mut hs, &self.shared.halt, seq);
                        return Err(RsisError::HandshakeTimeout);
                    }
                    self.shared
                        .signal
                        .wait_timeout(hs, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Drop a command the runner has not picked up yet
    fn withdraw(hs: &mut Handshake, halt: &AtomicBool, seq: u64) {
        let Some(pos) = hs.queue.iter().position(|(s, _)| *s == seq) else {
            return;
        };
        if let Some((_, command)) = hs.queue.remove(pos) {
            log::warn!("Withdrew {} command #{} after timeout", command.name(), seq);
            if command.halts()
                && hs.state == FrameworkState::Run
                && !hs.queue.iter().any(|(_, c)| c.halts())
            {
                halt.store(false, Ordering::Release);
            }
        }
    }

    /// Called with the handshake lock held
    fn spawn_runner(&self) -> Result<()> {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = runner.take() {
            let _ = old.join();
        }
        let ctx = Runner {
            shared: self.shared.clone(),
            scheduler: self.scheduler.clone(),
            core: self.core.clone(),
            channels: self.channels.clone(),
            end_time: self.config.end_time,
        };
        let handle = thread::Builder::new()
            .name("rsis-runner".to_string())
            .spawn(move || ctx.run())
            .map_err(|e| RsisError::Command(format!("failed to spawn runner: {}", e)))?;
        *runner = Some(handle);
        Ok(())
    }

    /// End the simulation, join the runner, and release every model and
    /// library. Afterwards the framework is in `NoState` and refuses calls.
    /// A second caller racing the first returns without waiting.
    pub fn shutdown(&self) {
        {
            let mut hs = self.shared.lock();
            if hs.state == FrameworkState::NoState || hs.closing {
                return;
            }
            hs.closing = true;
            self.shared.halt.store(true, Ordering::Release);
            while let Some((seq, command)) = hs.queue.pop_front() {
                log::debug!("Dropped queued {} command #{}", command.name(), seq);
                if hs.waiters.contains(&seq) {
                    hs.failures.insert(seq, RsisError::NotAlive);
                }
            }
            if hs.runner_alive {
                hs.issued += 1;
                let seq = hs.issued;
                hs.queue.push_back((seq, Command::End));
            }
        }
        self.shared.signal.notify_all();

        let handle = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Runner thread panicked");
            }
        }

        self.scheduler().drop_threads();
        {
            let mut core = self.core();
            core.registration.clear_models();
            for name in core.libraries.names() {
                core.registration.retract_library(&name);
            }
            core.libraries.clear();
        }
        self.channels.clear();

        self.shared.set_state(FrameworkState::NoState);
        log::info!("Framework shut down");
    }

    // --- THREADS ---

    pub fn new_thread(&self, frequency: f64) -> Result<usize> {
        let result = self
            .require("new_thread", &[FrameworkState::Config])
            .and_then(|_| self.scheduler().create_thread_handler(frequency));
        self.record(result)
    }

    pub fn clear_threads(&self) -> Result<()> {
        let result = self
            .require("clear_threads", &[FrameworkState::Config])
            .map(|_| self.scheduler().drop_threads());
        self.record(result)
    }

    pub fn thread_count(&self) -> Result<usize> {
        self.require("thread_count", SETTLED)?;
        Ok(self.scheduler().thread_count())
    }

    /// Swap in another scheduler. Threads and callbacks of the old one are
    /// dropped with it.
    pub fn set_scheduler(&self, scheduler: Box<dyn Scheduler>) -> Result<()> {
        let result = self.require("set_scheduler", &[FrameworkState::Config]).map(|_| {
            let clock = scheduler.clock();
            let name = scheduler.description().to_string();
            let mut current = self.scheduler();
            current.drop_threads();
            *current = scheduler;
            *self.clock.lock().unwrap_or_else(PoisonError::into_inner) = clock;
            log::info!("Scheduler set to {}", name);
            *self.scheduler_name.lock().unwrap_or_else(PoisonError::into_inner) = name;
        });
        self.record(result)
    }

    pub fn add_callback(&self, thread: usize, callback: Callback) -> Result<()> {
        let result = self
            .require("add_callback", &[FrameworkState::Config])
            .and_then(|_| self.scheduler().add_callback(thread, callback));
        self.record(result)
    }

    // --- LIBRARIES ---

    /// Load a plugin by name from the plugin directories or system path
    ///
    /// # Safety
    ///
    /// Loads and runs arbitrary native code.
    pub unsafe fn load_library(&self, name: &str) -> Result<()> {
        let result = self.require("load_library", SETTLED).and_then(|_| {
            let mut core = self.core();
            let handle = core.libraries.load_library(name)?;
            Self::register(&mut core, &handle)
        });
        self.record(result)
    }

    /// Load a plugin from an explicit path
    ///
    /// # Safety
    ///
    /// Loads and runs arbitrary native code.
    pub unsafe fn load_library_from(&self, name: &str, path: &Path) -> Result<()> {
        let result = self.require("load_library", SETTLED).and_then(|_| {
            let mut core = self.core();
            let handle = core.libraries.load_library_from(name, path)?;
            Self::register(&mut core, &handle)
        });
        self.record(result)
    }

    /// Register a plugin linked into the host binary
    pub fn register_static_library(&self, name: &str, entry: PluginEntryPoints) -> Result<()> {
        let result = self.require("load_library", SETTLED).and_then(|_| {
            let mut core = self.core();
            let handle = core.libraries.register_static(name, entry)?;
            Self::register(&mut core, &handle)
        });
        self.record(result)
    }

    fn register(core: &mut Core, handle: &crate::library::LibraryHandle) -> Result<()> {
        if let Err(e) = core.registration.register_library(handle) {
            let _ = core.libraries.unload_library(handle.name());
            return Err(e);
        }
        Ok(())
    }

    /// Unload a library that no live model depends on
    pub fn unload_library(&self, name: &str) -> Result<()> {
        let result = self.require("unload_library", SETTLED).and_then(|_| {
            let mut core = self.core();
            if !core.libraries.contains(name) {
                return Err(RsisError::UnknownLibrary(name.to_string()));
            }
            let instances = core.registration.live_instances(name);
            if instances > 0 {
                return Err(RsisError::LibraryInUse {
                    library: name.to_string(),
                    instances,
                });
            }
            core.registration.retract_library(name);
            core.libraries.unload_library(name)
        });
        self.record(result)
    }

    pub fn libraries(&self) -> Vec<String> {
        self.core().libraries.names()
    }

    // --- MODELS ---

    pub fn create_model(&self, library: &str, model_type: &str, name: &str) -> Result<()> {
        let result = self.require("create_model", &[FrameworkState::Config]).and_then(|_| {
            let mut core = self.core();
            let Core {
                libraries,
                registration,
            } = &mut *core;
            registration
                .create_model(libraries, library, model_type, name)
                .map(|_| ())
        });
        self.record(result)
    }

    pub fn destroy_model(&self, name: &str) -> Result<()> {
        let result = self
            .require("destroy_model", ALIVE)
            .and_then(|_| self.core().registration.destroy_model(name));
        self.record(result)
    }

    /// Unschedule a model's step callbacks, then destroy it. Connections
    /// touching the model still fail on their next tick.
    pub fn remove_model(&self, name: &str) -> Result<()> {
        let result = self.require("remove_model", SETTLED).and_then(|_| {
            let mut core = self.core();
            core.registration.model(name)?;
            let removed = self.scheduler().remove_callbacks(name);
            log::debug!("Unscheduled {} callback(s) of '{}'", removed, name);
            core.registration.destroy_model(name)
        });
        self.record(result)
    }

    pub fn config_model(&self, name: &str) -> Result<ConfigStatus> {
        let result = self.require("config_model", SETTLED).and_then(|_| {
            let mut core = self.core();
            let Core {
                libraries,
                registration,
            } = &mut *core;
            registration.config_model(libraries, name)
        });
        self.record(result)
    }

    pub fn model(&self, name: &str) -> Result<Arc<ModelInstance>> {
        self.require("model", ALIVE)?;
        self.core().registration.model(name)
    }

    pub fn models(&self) -> Vec<String> {
        self.core()
            .registration
            .models()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn schema(&self, model: &str) -> Result<Arc<ModelReflection>> {
        self.require("schema", ALIVE)?;
        self.core().registration.schema(model)
    }

    pub fn schema_json(&self, model: &str) -> Result<String> {
        let result = self
            .require("schema", ALIVE)
            .and_then(|_| self.core().registration.schema_json(model));
        self.record(result)
    }

    pub fn msg_get(&self, model: &str, field: &str) -> Result<Vec<u8>> {
        let result = self.model(model).and_then(|m| m.msg_get(field));
        self.record(result)
    }

    pub fn msg_set(&self, model: &str, field: &str, data: &[u8]) -> Result<()> {
        let result = self.model(model).and_then(|m| m.msg_set(field, data));
        self.record(result)
    }

    pub fn get_ptr(&self, model: &str, field: &str) -> Result<*mut u8> {
        let result = self.model(model).and_then(|m| m.get_ptr(field));
        self.record(result)
    }

    /// Step `model` from `thread` at `frequency`. The callback only observes
    /// the model, so destroying it turns the next tick into an error.
    pub fn schedule_model(&self, name: &str, thread: usize, frequency: f64, frame_offset: u64) -> Result<()> {
        let result = self
            .require("schedule_model", &[FrameworkState::Config])
            .and_then(|_| self.core().registration.model(name))
            .and_then(|model| {
                let weak = Arc::downgrade(&model);
                let model_name = name.to_string();
                let callback = Callback::new(name, frequency, frame_offset, move || {
                    match weak.upgrade() {
                        Some(model) => model.step(),
                        None => Err(RsisError::ModelDestroyed(model_name.clone())),
                    }
                });
                self.scheduler().add_callback(thread, callback)
            });
        self.record(result)
    }

    /// Copy `src_field` of `src` into `dst_field` of `dst` from `thread`
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        src: &str,
        src_field: &str,
        dst: &str,
        dst_field: &str,
        thread: usize,
        frequency: f64,
        frame_offset: u64,
    ) -> Result<()> {
        let result = self
            .require("connect", &[FrameworkState::Config])
            .and_then(|_| {
                let core = self.core();
                let src_model = core.registration.model(src)?;
                let dst_model = core.registration.model(dst)?;
                let src_schema = core.registration.schema(src)?;
                let dst_schema = core.registration.schema(dst)?;
                Connection::new(
                    &src_model,
                    &src_schema,
                    src_field,
                    &dst_model,
                    &dst_schema,
                    dst_field,
                )
            })
            .and_then(|connection| {
                log::info!("Connected {}", connection.name());
                self.scheduler()
                    .add_callback(thread, connection.into_callback(frequency, frame_offset))
            });
        self.record(result)
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const ALIVE: &[FrameworkState] = &[
    FrameworkState::Config,
    FrameworkState::Init,
    FrameworkState::Ready,
    FrameworkState::Pause,
    FrameworkState::Run,
    FrameworkState::End,
];

/// States in which the scheduler is not held by a pass
const SETTLED: &[FrameworkState] = &[
    FrameworkState::Config,
    FrameworkState::Ready,
    FrameworkState::Pause,
    FrameworkState::End,
];

// --- RUNNER ---

struct Runner {
    shared: Arc<Shared>,
    scheduler: SharedScheduler,
    core: Arc<Mutex<Core>>,
    channels: ChannelRegistry,
    end_time: Option<f64>,
}

enum Flow {
    Continue,
    Exit,
}

impl Runner {
    fn run(self) {
        log::debug!("Runner started");
        loop {
            let (seq, command, state) = {
                let mut hs = self.shared.lock();
                loop {
                    if let Some((seq, command)) = hs.queue.pop_front() {
                        let state = hs.state;
                        self.begin(&mut hs, command);
                        break (seq, command, state);
                    }
                    hs = self
                        .shared
                        .signal
                        .wait(hs)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let (result, flow) = self.execute(command, state);
            if let Err(e) = &result {
                log::warn!("Command {} failed: {}", command.name(), e);
            }
            self.complete(seq, result);
            if let Flow::Exit = flow {
                break;
            }
        }

        let mut hs = self.shared.lock();
        while let Some((seq, command)) = hs.queue.pop_front() {
            let err = RsisError::InvalidTransition {
                command: command.name(),
                state: hs.state,
            };
            if hs.waiters.contains(&seq) {
                hs.failures.insert(seq, err);
            }
            hs.completed = seq;
        }
        hs.runner_alive = false;
        drop(hs);
        self.shared.signal.notify_all();
        log::debug!("Runner exited");
    }

    /// Enter the transient state of `command` while still holding the lock
    /// it was popped under, so callers never see the gap
    fn begin(&self, hs: &mut Handshake, command: Command) {
        use FrameworkState::*;
        let next = match (command, hs.state) {
            (Command::Init, Config) => Init,
            (Command::Run | Command::Step(_), Ready | Pause) => {
                let halted = hs.queue.iter().any(|(_, c)| c.halts());
                self.shared.halt.store(halted, Ordering::Release);
                Run
            }
            _ => return,
        };
        hs.transition(next);
    }

    fn complete(&self, seq: u64, result: Result<()>) {
        let mut hs = self.shared.lock();
        if let Err(e) = result {
            hs.message = e.to_string();
            if hs.waiters.contains(&seq) {
                hs.failures.insert(seq, e);
            }
        }
        hs.completed = seq;
        drop(hs);
        self.shared.signal.notify_all();
    }

    fn models(&self) -> Vec<Arc<ModelInstance>> {
        self.core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registration
            .models()
    }

    fn execute(&self, command: Command, state: FrameworkState) -> (Result<()>, Flow) {
        use FrameworkState::*;
        match (command, state) {
            (Command::Init, Config) => (self.initialize(), Flow::Continue),
            (Command::Run, Ready | Pause) => self.pass(None),
            (Command::Step(steps), Ready | Pause) => self.pass(Some(steps)),
            // The halt flag already stopped any pass
            (Command::Pause, Pause) => (Ok(()), Flow::Continue),
            (Command::End, _) => {
                self.finish();
                (Ok(()), Flow::Exit)
            }
            (command, state) => (
                Err(RsisError::InvalidTransition {
                    command: command.name(),
                    state,
                }),
                Flow::Continue,
            ),
        }
    }

    fn initialize(&self) -> Result<()> {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .init();
        let channels = self.channels.host_table();
        let result =
            scheduler.and_then(|_| self.models().iter().try_for_each(|m| m.init(&channels)));
        match result {
            Ok(()) => {
                self.shared.set_state(FrameworkState::Ready);
                Ok(())
            }
            Err(e) => {
                log::error!("Initialization failed: {}", e);
                self.shared.set_state(FrameworkState::Config);
                Err(e)
            }
        }
    }

    fn pass(&self, steps: Option<u64>) -> (Result<()>, Flow) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);

        let remaining = self.end_time.map(|end| {
            let end_step = (end * scheduler.frequency()).round() as i64;
            end_step.saturating_sub(scheduler.time().step).max(0) as u64
        });
        let (limit, ends) = match (steps, remaining) {
            (Some(s), Some(r)) if r <= s => (Some(r), true),
            (Some(s), _) => (Some(s), false),
            (None, r) => (r, r.is_some()),
        };

        let result = scheduler.run(limit, &self.shared.halt);
        drop(scheduler);

        match result {
            Ok(report) => {
                log::info!(
                    "Pass finished after {} tick(s) at step {} ({:?})",
                    report.ticks,
                    report.time.step,
                    report.reason
                );
                if ends && report.reason == StopReason::Limit {
                    self.finish();
                    return (Ok(()), Flow::Exit);
                }
                self.pause_models();
                self.shared.set_state(FrameworkState::Pause);
                (Ok(()), Flow::Continue)
            }
            Err(e) => {
                log::error!("Pass failed: {}", e);
                self.pause_models();
                self.shared.set_state(FrameworkState::Pause);
                (Err(e), Flow::Continue)
            }
        }
    }

    fn pause_models(&self) {
        for model in self.models() {
            if let Err(e) = model.pause() {
                log::warn!("{}", e);
            }
        }
    }

    fn finish(&self) {
        for model in self.models() {
            if let Err(e) = model.stop() {
                log::warn!("{}", e);
            }
        }
        self.shared.set_state(FrameworkState::End);
    }
}
