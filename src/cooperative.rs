//! Cooperative clock
//!
//! The engine loop is an async task on the crate's single-threaded executor.
//! It suspends on a notification future and resumes when a mutation or `tick`
//! pokes it. Everything stays on one thread.

use crate::error::ClockError;
use crate::event::{CallbackResult, EventId, EventInfo, LocalProcedure};
use crate::executor::{Executor, TaskHandle};
use crate::moment::{Moment, TimeSignature, TimeUnit};
use crate::scheduler::{ClockConfig, ClockCore, StartOptions};
use crate::tempo::{TempoChange, TempoMap};
use crate::time::{MonotonicTime, TimeSource};
use log::{debug, info};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// One-slot wakeup shared between a loop task and whoever pokes it.
#[derive(Default)]
struct Signal {
    pending: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Signal {
    fn notify(&self) {
        self.pending.set(true);
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn notified(self: &Rc<Self>) -> Notified {
        Notified {
            signal: self.clone(),
        }
    }
}

struct Notified {
    signal: Rc<Signal>,
}

impl Future for Notified {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.pending.replace(false) {
            return Poll::Ready(());
        }
        *self.signal.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

struct Inner {
    core: RefCell<ClockCore<LocalProcedure>>,
    executor: Executor,
    time: Box<dyn TimeSource>,
    /// Signal of the current generation's loop.
    signal: RefCell<Rc<Signal>>,
}

impl Inner {
    fn notify(&self) {
        let signal = self.signal.borrow().clone();
        signal.notify();
    }

    /// Fire everything due, reading the time afresh for each event. No borrow
    /// of the core is held while a callback runs.
    fn fire_due(&self) {
        loop {
            let now = self.time.now();
            let Some(mut firing) = self.core.borrow_mut().next_firing(now) else {
                break;
            };
            let result = firing.invoke();
            self.core.borrow_mut().finish(firing, result);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The parked loop task owns an Rc to the signal; dropping its waker
        // frees the task.
        self.signal.get_mut().waker.borrow_mut().take();
    }
}

async fn drive(inner: Weak<Inner>, signal: Rc<Signal>, generation: u64) {
    loop {
        {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.core.borrow().generation() != generation {
                debug!("loop for generation {} exited", generation);
                return;
            }
            inner.fire_due();
        }
        signal.notified().await;
    }
}

/// A single-threaded clock. Clones share the same clock.
///
/// Nothing fires until the clock is driven with [`tick`](Self::tick), either
/// directly or through one of the runners in [`engine`](crate::engine).
#[derive(Clone)]
pub struct CooperativeClock {
    inner: Rc<Inner>,
}

impl CooperativeClock {
    /// Create a stopped clock on the monotonic wall clock.
    pub fn new(config: ClockConfig) -> Result<Self, ClockError> {
        Self::with_time_source(config, MonotonicTime::new())
    }

    pub fn with_time_source(
        config: ClockConfig,
        time: impl TimeSource + 'static,
    ) -> Result<Self, ClockError> {
        Ok(Self {
            inner: Rc::new(Inner {
                core: RefCell::new(ClockCore::new(&config)?),
                executor: Executor::new(),
                time: Box::new(time),
                signal: RefCell::new(Rc::new(Signal::default())),
            }),
        })
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ClockCore<LocalProcedure>, f64) -> R) -> R {
        let now = self.inner.time.now();
        let result = f(&mut self.inner.core.borrow_mut(), now);
        self.inner.notify();
        result
    }

    fn read<R>(&self, f: impl FnOnce(&mut ClockCore<LocalProcedure>) -> R) -> R {
        f(&mut self.inner.core.borrow_mut())
    }

    pub fn now(&self) -> f64 {
        self.inner.time.now()
    }

    pub fn start(&self) -> Result<(), ClockError> {
        self.start_with(StartOptions::default())
    }

    pub fn start_with(&self, options: StartOptions) -> Result<(), ClockError> {
        let generation = self.mutate(|core, now| {
            core.start(now, &options)?;
            Ok::<_, ClockError>(core.generation())
        })?;
        let signal = Rc::new(Signal::default());
        *self.inner.signal.borrow_mut() = signal.clone();
        self.inner
            .executor
            .spawn(drive(Rc::downgrade(&self.inner), signal, generation));
        info!("cooperative clock started");
        Ok(())
    }

    /// Stop the clock. The loop task exits the next time it is driven.
    pub fn stop(&self) {
        self.mutate(|core, _| core.stop());
    }

    /// Wake the loop and run the executor until every task is parked.
    pub fn tick(&self) -> usize {
        self.inner.notify();
        self.inner.executor.run_until_stalled()
    }

    /// Run a caller task on the clock's executor.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskHandle {
        self.inner.executor.spawn(fut)
    }

    /// Due time of the next queued event while running.
    pub fn next_due(&self) -> Option<f64> {
        self.read(|core| if core.is_running() { core.next_due() } else { None })
    }

    /// Seconds until the loop next has work, never negative.
    pub fn next_wait(&self) -> Option<f64> {
        let slop = self.slop();
        let due = self.next_due()?;
        Some((due - slop - self.now()).max(0.0))
    }

    pub fn schedule<F>(&self, procedure: F, at: f64, unit: TimeUnit) -> Result<EventId, ClockError>
    where
        F: FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + 'static,
    {
        self.mutate(|core, _| core.schedule(Box::new(procedure), at, unit))
    }

    pub fn cue<F>(&self, procedure: F, quantization: Option<&str>) -> Result<EventId, ClockError>
    where
        F: FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + 'static,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use crate::time::VirtualTime;

    fn clock() -> (CooperativeClock, VirtualTime) {
        let time = VirtualTime::new(0.0);
        let clock = CooperativeClock::with_time_source(ClockConfig::default(), time.clone()).unwrap();
        (clock, time)
    }

    #[test]
    fn test_nothing_fires_until_ticked() {
        let (clock, _time) = clock();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        clock
            .schedule(
                move |_, _, _| {
                    c.set(c.get() + 1);
                    Ok(Action::Stop)
                },
                0.0,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.start().unwrap();
        assert_eq!(count.get(), 0);
        clock.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_next_wait() {
        let (clock, time) = clock();
        clock
            .schedule(|_, _, _| Ok(Action::Stop), 0.5, TimeUnit::Beats)
            .unwrap();
        assert_eq!(clock.next_wait(), None);
        clock.start().unwrap();
        assert!((clock.next_wait().unwrap() - 0.999).abs() < 1e-12);
        time.set(2.0);
        assert_eq!(clock.next_wait(), Some(0.0));
        clock.tick();
        assert_eq!(clock.next_wait(), None);
    }

    #[test]
    fn test_callback_reenters_clock() {
        let (clock, _time) = clock();
        let inner_clock = clock.clone();
        let later = Rc::new(Cell::new(false));
        let l = later.clone();
        clock
            .schedule(
                move |_, _, _| {
                    let l = l.clone();
                    inner_clock.schedule(
                        move |_, _, _| {
                            l.set(true);
                            Ok(Action::Stop)
                        },
                        0.0,
                        TimeUnit::Beats,
                    )?;
                    inner_clock.change(TempoChange::tempo(90.0))?;
                    Ok(Action::Stop)
                },
                0.0,
                TimeUnit::Beats,
            )
            .unwrap();
        clock.start().unwrap();
        clock.tick();
        assert!(later.get());
        assert_eq!(clock.beats_per_minute(), 90.0);
    }

    #[test]
    fn test_restart_replaces_loop() {
        let (clock, time) = clock();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        clock
            .schedule(
                move |_, _, _| {
                    c.set(c.get() + 1);
                    Ok(Action::after_seconds(1.0))
                },
                0.0,
                TimeUnit::Seconds,
            )
            .unwrap();
        clock.start().unwrap();
        clock.tick();
        clock.stop();
        clock.start().unwrap();
        clock.tick();
        assert_eq!(count.get(), 1);

        time.set(1.0);
        clock.tick();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_spawned_tasks_share_executor() {
        let (clock, _time) = clock();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let handle = clock.spawn(async move { r.set(true) });
        clock.tick();
        assert!(ran.get());
        assert!(handle.is_finished());
    }
}
