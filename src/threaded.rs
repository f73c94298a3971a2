//! Thread-parallel clock
//!
//! A worker thread drives the shared `ClockCore`. Every mutation goes through
//! the same mutex and wakes the worker; callbacks run with the lock released.

use crate::error::ClockError;
use crate::event::{CallbackResult, EventId, EventInfo, Procedure};
use crate::moment::{Moment, TimeSignature, TimeUnit};
use crate::scheduler::{ClockConfig, ClockCore, StartOptions};
use crate::tempo::{TempoChange, TempoMap};
use crate::time::{MonotonicTime, TimeSource};
use log::{debug, info};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

struct WorkerState {
    core: ClockCore<Procedure>,
    /// Bumped by every mutation.
    revision: u64,
    /// Latest revision the worker has fully drained.
    idle_revision: u64,
    worker_thread: Option<ThreadId>,
}

struct Shared {
    state: Mutex<WorkerState>,
    /// Mutations and stop requests.
    wake: Condvar,
    /// The worker finished a pass.
    idle: Condvar,
    time: Arc<dyn TimeSource>,
}

/// Cloneable, thread-safe access to a running or stopped `TempoClock`.
#[derive(Clone)]
pub struct ClockHandle {
    shared: Arc<Shared>,
}

impl ClockHandle {
    /// Lock the state, apply `f`, then wake the worker.
    fn mutate<R>(&self, f: impl FnOnce(&mut ClockCore<Procedure>, f64) -> R) -> R {
        let now = self.shared.time.now();
        let result = {
            let mut state = self.shared.state.lock();
            let result = f(&mut state.core, now);
            state.revision += 1;
            result
        };
        self.shared.wake.notify_all();
        result
    }

    fn read<R>(&self, f: impl FnOnce(&mut ClockCore<Procedure>) -> R) -> R {
        f(&mut self.shared.state.lock().core)
    }

    /// Current reading of the clock's time source.
    pub fn now(&self) -> f64 {
        self.shared.time.now()
    }

    /// Schedule `procedure` at `at` (offset, measure, or seconds after the epoch).
    pub fn schedule<F>(&self, procedure: F, at: f64, unit: TimeUnit) -> Result<EventId, ClockError>
    where
        F: FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + Send + 'static,
    {
        self.mutate(|core, _| core.schedule(Box::new(procedure), at, unit))
    }

    /// Schedule `procedure` at the next point of a quantization grid, or now.
    pub fn cue<F>(&self, procedure: F, quantization: Option<&str>) -> Result<EventId, ClockError>
    where
        F: FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + Send + 'static,
    {
        self.mutate(|core, now| core.cue(Box::new(procedure), quantization, now))
    }

    pub fn change(&self, change: TempoChange) -> Result<Option<EventId>, ClockError> {
        self.mutate(|core, now| core.change(change, now))
    }

    pub fn schedule_change(
        &self,
        change: TempoChange,
        at: f64,
        unit: TimeUnit,
    ) -> Result<EventId, ClockError> {
        self.mutate(|core, _| core.schedule_change(change, at, unit))
    }

    pub fn reschedule(&self, id: EventId, at: f64, unit: TimeUnit) -> Result<bool, ClockError> {
        self.mutate(|core, _| core.reschedule(id, at, unit))
    }

    pub fn cancel(&self, id: EventId) -> bool {
        self.mutate(|core, _| core.cancel(id))
    }

    pub fn peek(&self) -> Option<Moment> {
        self.read(|core| core.peek())
    }

    pub fn is_running(&self) -> bool {
        self.read(|core| core.is_running())
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.read(|core| core.beats_per_minute())
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.read(|core| core.time_signature())
    }

    pub fn slop(&self) -> f64 {
        self.read(|core| core.slop())
    }

    pub fn set_slop(&self, slop: f64) -> Result<(), ClockError> {
        self.mutate(|core, _| core.set_slop(slop))
    }

    pub fn tempo_map(&self) -> TempoMap {
        self.read(|core| core.tempo_map().clone())
    }

    /// Block until the worker has drained everything due as of this call.
    /// Returns at once when stopped or when called from a callback.
    pub fn wait_until_idle(&self) {
        let mut state = self.shared.state.lock();
        if state.worker_thread == Some(thread::current().id()) {
            return;
        }
        state.revision += 1;
        let target = state.revision;
        self.shared.wake.notify_all();
        while state.core.is_running() && state.idle_revision < target {
            self.shared.idle.wait(&mut state);
        }
    }
}

fn run_worker(shared: Arc<Shared>, generation: u64) {
    let mut state = shared.state.lock();
    state.worker_thread = Some(thread::current().id());
    debug!("worker for generation {} running", generation);

    while state.core.generation() == generation {
        let revision = state.revision;
        let now = shared.time.now();

        if let Some(mut firing) = state.core.next_firing(now) {
            let result = MutexGuard::unlocked(&mut state, || firing.invoke());
            state.core.finish(firing, result);
            continue;
        }

        state.idle_revision = revision;
        shared.idle.notify_all();

        match state.core.next_due() {
            Some(due) => {
                let slop = state.core.slop();
                let wait = (due - slop - now).min(slop).max(0.0);
                shared.wake.wait_for(&mut state, Duration::from_secs_f64(wait));
            }
            None => shared.wake.wait(&mut state),
        }
    }

    if state.worker_thread == Some(thread::current().id()) {
        state.worker_thread = None;
    }
    shared.idle.notify_all();
    debug!("worker for generation {} exited", generation);
}

/// A clock driven by its own worker thread.
///
/// Dereferences to [`ClockHandle`] for everything except starting and
/// stopping. Dropping the clock stops it.
pub struct TempoClock {
    handle: ClockHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TempoClock {
    /// Create a stopped clock on the monotonic wall clock.
    pub fn new(config: ClockConfig) -> Result<Self, ClockError> {
        Self::with_time_source(config, MonotonicTime::new())
    }

    pub fn with_time_source(
        config: ClockConfig,
        time: impl TimeSource + 'static,
    ) -> Result<Self, ClockError> {
        let core = ClockCore::new(&config)?;
        Ok(Self {
            handle: ClockHandle {
                shared: Arc::new(Shared {
                    state: Mutex::new(WorkerState {
                        core,
                        revision: 0,
                        idle_revision: 0,
                        worker_thread: None,
                    }),
                    wake: Condvar::new(),
                    idle: Condvar::new(),
                    time: Arc::new(time),
                }),
            },
            worker: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    pub fn start(&self) -> Result<(), ClockError> {
        self.start_with(StartOptions::default())
    }

    pub fn start_with(&self, options: StartOptions) -> Result<(), ClockError> {
        let generation = self.handle.mutate(|core, now| {
            core.start(now, &options)?;
            Ok::<_, ClockError>(core.generation())
        })?;

        // A worker left over from before the last stop exits on its own.
        let previous = self.worker.lock().take();
        join_unless_current(previous);

        let shared = self.handle.shared.clone();
        let spawned = thread::Builder::new()
            .name("tempo-clock".to_string())
            .spawn(move || run_worker(shared, generation));
        match spawned {
            Ok(worker) => {
                *self.worker.lock() = Some(worker);
                info!("tempo clock worker started");
                Ok(())
            }
            Err(err) => {
                self.handle.mutate(|core, _| core.stop());
                Err(ClockError::Spawn(err))
            }
        }
    }

    /// Stop the clock and wait for the worker, including any callback it is
    /// running. Called from a callback, it only flags the stop.
    pub fn stop(&self) {
        self.handle.mutate(|core, _| core.stop());
        self.handle.shared.idle.notify_all();
        let worker = self.worker.lock().take();
        join_unless_current(worker);
    }
}

fn join_unless_current(worker: Option<JoinHandle<()>>) {
    if let Some(worker) = worker {
        if worker.thread().id() != thread::current().id() {
            let _ = worker.join();
        }
    }
}

impl Deref for TempoClock {
    type Target = ClockHandle;

    fn deref(&self) -> &ClockHandle {
        &self.handle
    }
}

impl Drop for TempoClock {
    fn drop(&mut self) {
        self.stop();
    }
}
