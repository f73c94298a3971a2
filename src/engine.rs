//! Engine - realtime and offline drivers for the cooperative clock
//!
//! - Offline: jumps a virtual time source from one due time to the next, so
//!   every event fires exactly on its desired moment.
//! - Realtime: follows the monotonic wall clock, sleeping with spin_sleep.

use crate::cooperative::CooperativeClock;
use crate::error::ClockError;
use crate::scheduler::{ClockConfig, StartOptions};
use crate::time::{TimeSource, VirtualTime};
use log::warn;
use spin_sleep::SpinSleeper;
use std::time::Duration;

/// Upper bound on due times processed by one `advance_to`.
const MAX_TIMESLICES: usize = 200_000;

/// Idle poll interval when nothing is queued.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Longest single sleep; far-off events are approached in steps.
const MAX_SLEEP_SECS: f64 = 1.0;

fn sleep_duration(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0).min(MAX_SLEEP_SECS))
}

/// Drives a clock on virtual time, faster than realtime.
pub struct OfflineRunner {
    clock: CooperativeClock,
    time: VirtualTime,
}

impl OfflineRunner {
    /// Create a runner whose clock is stopped at virtual time 0.
    pub fn new(config: ClockConfig) -> Result<Self, ClockError> {
        let time = VirtualTime::new(0.0);
        let clock = CooperativeClock::with_time_source(config, time.clone())?;
        Ok(Self { clock, time })
    }

    /// Create a runner and start its clock at virtual time 0.
    pub fn started(config: ClockConfig, options: StartOptions) -> Result<Self, ClockError> {
        let runner = Self::new(config)?;
        runner.clock.start_with(options)?;
        runner.clock.tick();
        Ok(runner)
    }

    pub fn clock(&self) -> &CooperativeClock {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.time.now()
    }

    /// Fire everything due up to `target`, visiting each due time in order.
    /// Time never moves backwards. Returns the number of due times visited.
    pub fn advance_to(&mut self, target: f64) -> usize {
        // Let work queued at the current time settle first
        self.clock.tick();

        let mut processed = 0;
        while let Some(due) = self.clock.next_due() {
            if due > target {
                break;
            }
            self.time.set(due.max(self.time.now()));
            self.clock.tick();

            processed += 1;
            if processed >= MAX_TIMESLICES {
                warn!(
                    "advance_to({}) stopped after {} time slices - likely runaway rescheduling",
                    target, processed
                );
                break;
            }
        }

        self.time.set(target.max(self.time.now()));
        self.clock.tick();
        processed
    }

    /// Step forward by a number of seconds.
    pub fn step_sec(&mut self, dt: f64) -> usize {
        let s = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        let target = self.now() + s;
        self.advance_to(target)
    }
}

/// Drives a clock on wall-clock time.
pub struct RealtimeRunner {
    clock: CooperativeClock,
    sleeper: SpinSleeper,
}

impl RealtimeRunner {
    /// Create a runner over a clock on the monotonic wall clock.
    pub fn new(config: ClockConfig) -> Result<Self, ClockError> {
        Ok(Self::with_clock(CooperativeClock::new(config)?))
    }

    pub fn with_clock(clock: CooperativeClock) -> Self {
        Self {
            clock,
            sleeper: SpinSleeper::default(),
        }
    }

    pub fn clock(&self) -> &CooperativeClock {
        &self.clock
    }

    /// Run until the given condition is true.
    pub fn run_until<F>(&mut self, is_done: F)
    where
        F: Fn() -> bool,
    {
        self.run(None, is_done);
    }

    /// Run for `seconds` of wall-clock time.
    pub fn run_for(&mut self, seconds: f64) {
        let deadline = self.clock.now() + seconds.max(0.0);
        self.run(Some(deadline), || false);
    }

    fn run<F>(&mut self, deadline: Option<f64>, is_done: F)
    where
        F: Fn() -> bool,
    {
        loop {
            self.clock.tick();

            if is_done() {
                break;
            }
            let now = self.clock.now();
            if deadline.is_some_and(|d| now >= d) {
                break;
            }

            let mut wait = match self.clock.next_wait() {
                Some(wait) => sleep_duration(wait),
                None => IDLE_SLEEP,
            };
            if let Some(d) = deadline {
                wait = wait.min(sleep_duration(d - now));
            }
            if !wait.is_zero() {
                self.sleeper.sleep(wait);
            }
        }
    }
}
