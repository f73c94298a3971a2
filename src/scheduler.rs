//! Clock Engine core
//!
//! State machine, event bookkeeping and the pop/fire/finish cycle shared by the
//! threaded and cooperative clocks. Nothing in here blocks or reads a time
//! source; callers pass `now` in.

use crate::error::ClockError;
use crate::event::{Action, CallbackResult, Event, EventId, EventInfo, Payload, Target};
use crate::moment::{Moment, TimeSignature, TimeUnit};
use crate::quantize::Quantization;
use crate::queue::EventQueue;
use crate::tempo::{Commit, TempoChange, TempoMap};
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Settings a clock is created with.
#[derive(Clone, Debug)]
pub struct ClockConfig {
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
    /// Seconds early an event may fire; also the idle poll granularity.
    pub slop: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            beats_per_minute: 120.0,
            time_signature: TimeSignature::COMMON,
            slop: 0.001,
        }
    }
}

/// Where the timeline begins when a clock starts.
#[derive(Clone, Debug)]
pub struct StartOptions {
    pub initial_offset: f64,
    pub initial_measure: i64,
    /// Overrides the pending tempo.
    pub beats_per_minute: Option<f64>,
    /// Overrides the pending time signature.
    pub time_signature: Option<TimeSignature>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            initial_offset: 0.0,
            initial_measure: 1,
            beats_per_minute: None,
            time_signature: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    Stopped,
    Running,
}

fn check_slop(slop: f64) -> Result<f64, ClockError> {
    if slop.is_finite() && slop > 0.0 {
        Ok(slop)
    } else {
        Err(ClockError::InvalidSlop(slop))
    }
}

fn check_time(at: f64) -> Result<f64, ClockError> {
    if at.is_finite() {
        Ok(at)
    } else {
        Err(ClockError::InvalidTime(at))
    }
}

/// A callback popped from the queue, ready to run outside the clock's lock.
pub(crate) struct Firing<P> {
    procedure: P,
    pub current: Moment,
    pub desired: Moment,
    pub info: EventInfo,
}

impl<P> Firing<P>
where
    P: FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult,
{
    /// Run the procedure. A panic is reported as an error result.
    pub fn invoke(&mut self) -> CallbackResult {
        let Firing {
            procedure,
            current,
            desired,
            info,
        } = self;
        match panic::catch_unwind(AssertUnwindSafe(|| procedure(&*current, &*desired, &*info))) {
            Ok(result) => result,
            Err(payload) => Err(panic_message(payload).into()),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("callback panicked: {s}")
    } else {
        "callback panicked".to_string()
    }
}

struct InFlight {
    id: EventId,
    cancelled: bool,
}

/// The clock's state, independent of how it is driven.
pub(crate) struct ClockCore<P> {
    tempo: TempoMap,
    queue: EventQueue<P>,
    state: RunState,
    /// Bumped by every start and stop; loops exit when it moves on.
    generation: u64,
    slop: f64,
    next_id: u64,
    /// One entry per callback currently running. A worker left over from a
    /// stop can still be finishing while the next run fires its own.
    in_flight: Vec<InFlight>,
}

impl<P> ClockCore<P> {
    pub fn new(config: &ClockConfig) -> Result<Self, ClockError> {
        Ok(Self {
            tempo: TempoMap::new(config.beats_per_minute, config.time_signature)?,
            queue: EventQueue::new(),
            state: RunState::Stopped,
            generation: 0,
            slop: check_slop(config.slop)?,
            next_id: 0,
            in_flight: Vec::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slop(&self) -> f64 {
        self.slop
    }

    pub fn set_slop(&mut self, slop: f64) -> Result<(), ClockError> {
        self.slop = check_slop(slop)?;
        Ok(())
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.tempo.latest().beats_per_minute
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.tempo.latest().time_signature
    }

    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo
    }

    /// Time-source seconds at which the timeline's origin sits.
    fn epoch(&self) -> f64 {
        self.tempo.origin_seconds()
    }

    pub fn start(&mut self, now: f64, options: &StartOptions) -> Result<(), ClockError> {
        if self.is_running() {
            return Err(ClockError::AlreadyRunning);
        }
        check_time(options.initial_offset)?;
        self.tempo.restart(
            now,
            options.initial_offset,
            options.initial_measure,
            options.beats_per_minute,
            options.time_signature,
        )?;
        self.state = RunState::Running;
        self.generation += 1;
        self.rekey();
        info!(
            "clock started at {:.6}s ({} BPM, {})",
            now,
            self.beats_per_minute(),
            self.time_signature()
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.state = RunState::Stopped;
        self.generation += 1;
        self.tempo.collapse();
        self.rekey();
        info!("clock stopped with {} queued events", self.queue.len());
    }

    fn alloc_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    fn target_offset(&self, target: Target) -> f64 {
        match target {
            Target::Offset(offset) => offset,
            Target::Measure(measure) => self.tempo.measure_to_offset(measure),
            Target::Seconds(seconds) => self.tempo.seconds_to_offset(self.epoch() + seconds),
        }
    }

    fn due_seconds(&self, target: Target) -> f64 {
        match target {
            Target::Seconds(seconds) => self.epoch() + seconds,
            other => self.tempo.offset_to_seconds(self.target_offset(other)),
        }
    }

    fn desired_moment(&self, target: Target) -> Moment {
        match target {
            Target::Seconds(seconds) => self.tempo.moment_at_seconds(self.epoch() + seconds),
            other => self.tempo.moment_at_offset(self.target_offset(other)),
        }
    }

    /// Recompute every queued event's due time under the current map.
    fn rekey(&mut self) {
        self.rekey_where(|_| true);
    }

    fn rekey_where(&mut self, matches: impl Fn(&Target) -> bool) {
        for id in self.queue.ids() {
            let Some(target) = self.queue.get_mut(id).map(|e| e.target) else {
                continue;
            };
            if matches(&target) {
                let due = self.due_seconds(target);
                self.queue.reinsert(id, due);
            }
        }
    }

    fn enqueue(&mut self, target: Target, payload: Payload<P>) -> EventId {
        let id = self.alloc_id();
        let due = self.due_seconds(target);
        self.queue.insert(
            Event {
                id,
                target,
                invocations: 0,
                payload,
            },
            due,
        )
    }

    pub fn schedule(&mut self, procedure: P, at: f64, unit: TimeUnit) -> Result<EventId, ClockError> {
        let target = Target::from_unit(check_time(at)?, unit);
        let id = self.enqueue(target, Payload::Callback(procedure));
        debug!("scheduled {} at {:?}", id, target);
        Ok(id)
    }

    /// Moment that quantized cues are measured from.
    fn reference_moment(&self, now: f64) -> Moment {
        if self.is_running() {
            self.tempo.moment_at_seconds(now)
        } else {
            self.tempo.moment_at_offset(self.tempo.origin_offset())
        }
    }

    pub fn cue(
        &mut self,
        procedure: P,
        quantization: Option<&str>,
        now: f64,
    ) -> Result<EventId, ClockError> {
        let quantization = quantization
            .map(str::parse::<Quantization>)
            .transpose()?;
        let reference = self.reference_moment(now);
        let target = match quantization {
            Some(q) => q.resolve(&reference),
            None => Target::Offset(reference.offset),
        };
        let id = self.enqueue(target, Payload::Callback(procedure));
        debug!("cued {} at {:?}", id, target);
        Ok(id)
    }

    /// Stopped: amend the pending tempo at once. Running: queue the change for
    /// the engine to commit at `now`.
    pub fn change(&mut self, change: TempoChange, now: f64) -> Result<Option<EventId>, ClockError> {
        change.validate()?;
        if !self.is_running() {
            self.tempo.amend_pending(change)?;
            self.rekey();
            return Ok(None);
        }
        let target = Target::Seconds(check_time(now)? - self.epoch());
        Ok(Some(self.enqueue(target, Payload::Change(change))))
    }

    pub fn schedule_change(
        &mut self,
        change: TempoChange,
        at: f64,
        unit: TimeUnit,
    ) -> Result<EventId, ClockError> {
        change.validate()?;
        let target = Target::from_unit(check_time(at)?, unit);
        let id = self.enqueue(target, Payload::Change(change));
        debug!("scheduled change {} at {:?}", id, target);
        Ok(id)
    }

    /// Move a queued event. Returns false if it is not queued.
    pub fn reschedule(&mut self, id: EventId, at: f64, unit: TimeUnit) -> Result<bool, ClockError> {
        let target = Target::from_unit(check_time(at)?, unit);
        let Some(event) = self.queue.get_mut(id) else {
            return Ok(false);
        };
        event.target = target;
        let due = self.due_seconds(target);
        Ok(self.queue.reinsert(id, due))
    }

    /// Cancel a queued event, or stop an in-flight one from being requeued.
    pub fn cancel(&mut self, id: EventId) -> bool {
        if self.queue.remove(id).is_some() {
            debug!("cancelled {}", id);
            return true;
        }
        match self.in_flight.iter_mut().find(|flight| flight.id == id) {
            Some(flight) if !flight.cancelled => {
                flight.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Desired moment of the next queued event.
    pub fn peek(&mut self) -> Option<Moment> {
        let target = self.queue.peek()?.target;
        Some(self.desired_moment(target))
    }

    pub fn next_due(&mut self) -> Option<f64> {
        self.queue.peek_due()
    }

    /// Commit due changes and pop the next due callback, if any.
    pub fn next_firing(&mut self, now: f64) -> Option<Firing<P>> {
        if !self.is_running() {
            return None;
        }
        while let Some((_, event)) = self.queue.pop_if_due(now + self.slop) {
            let info = event.info();
            match event.payload {
                Payload::Change(change) => self.commit_change(info.id, info.target, change),
                Payload::Callback(procedure) => {
                    self.in_flight.push(InFlight {
                        id: info.id,
                        cancelled: false,
                    });
                    return Some(Firing {
                        procedure,
                        current: self.tempo.moment_at_seconds(now),
                        desired: self.desired_moment(info.target),
                        info,
                    });
                }
            }
        }
        None
    }

    fn commit_change(&mut self, id: EventId, target: Target, change: TempoChange) {
        let offset = self.target_offset(target);
        match self.tempo.apply_change(offset, change) {
            Ok(Commit::Appended) => debug!("change {} committed at offset {:.6}", id, offset),
            Ok(Commit::Regenerated { replayed }) => warn!(
                "change {} at offset {:.6} predates the tempo map; replayed {} later segments",
                id, offset, replayed
            ),
            Err(err) => {
                error!("change {} rejected: {}", id, err);
                return;
            }
        }
        // Seconds targets keep their due time; the epoch has not moved.
        self.rekey_where(Target::follows_tempo);
    }

    /// Apply a fired callback's result.
    pub fn finish(&mut self, firing: Firing<P>, result: CallbackResult) {
        let Firing {
            procedure,
            desired,
            info,
            ..
        } = firing;
        let cancelled = match self.in_flight.iter().position(|flight| flight.id == info.id) {
            Some(idx) => self.in_flight.swap_remove(idx).cancelled,
            None => false,
        };
        if cancelled {
            debug!("{} cancelled while in flight", info.id);
            return;
        }

        let (delta, unit) = match result {
            Ok(Action::Reschedule { delta, unit }) => (delta, unit),
            Ok(Action::Stop) => {
                debug!("{} finished after {} invocations", info.id, info.invocations + 1);
                return;
            }
            Err(err) => {
                error!("{} failed: {}", info.id, err);
                return;
            }
        };
        if !(delta.is_finite() && delta > 0.0) {
            warn!("{} asked to reschedule by {}; dropping it", info.id, delta);
            return;
        }

        let target = match unit {
            TimeUnit::Beats => Target::Offset(desired.offset + delta),
            TimeUnit::Measures => {
                Target::Measure(self.tempo.measure_position(desired.offset) + delta)
            }
            TimeUnit::Seconds => Target::Seconds(desired.seconds - self.epoch() + delta),
        };
        let due = self.due_seconds(target);
        self.queue.insert(
            Event {
                id: info.id,
                target,
                invocations: info.invocations + 1,
                payload: Payload::Callback(procedure),
            },
            due,
        );
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queued(&self, id: EventId) -> bool {
        self.queue.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Proc = Box<dyn FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult>;

    fn core() -> ClockCore<Proc> {
        ClockCore::new(&ClockConfig::default()).unwrap()
    }

    fn procedure(f: impl FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + 'static) -> Proc {
        Box::new(f)
    }

    fn every(delta: f64) -> Proc {
        procedure(move |_, _, _| Ok(Action::after_beats(delta)))
    }

    fn fire(core: &mut ClockCore<Proc>, now: f64) -> Option<(Moment, Moment, EventInfo)> {
        let mut firing = core.next_firing(now)?;
        let result = firing.invoke();
        let row = (firing.current, firing.desired, firing.info);
        core.finish(firing, result);
        Some(row)
    }

    #[test]
    fn test_core_creation() {
        let core = core();
        assert!(!core.is_running());
        assert_eq!(core.beats_per_minute(), 120.0);
        assert_eq!(core.time_signature(), TimeSignature::COMMON);
        assert_eq!(core.slop(), 0.001);
        assert_eq!(core.generation(), 0);
    }

    #[test]
    fn test_invalid_config() {
        let bad_slop = ClockConfig {
            slop: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            ClockCore::<Proc>::new(&bad_slop),
            Err(ClockError::InvalidSlop(_))
        ));
        let bad_tempo = ClockConfig {
            beats_per_minute: f64::INFINITY,
            ..Default::default()
        };
        assert!(ClockCore::<Proc>::new(&bad_tempo).is_err());
    }

    #[test]
    fn test_start_twice_fails() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        assert!(matches!(
            core.start(1.0, &StartOptions::default()),
            Err(ClockError::AlreadyRunning)
        ));
        assert_eq!(core.tempo_map().origin_seconds(), 0.0);
        assert_eq!(core.generation(), 1);
    }

    #[test]
    fn test_nothing_fires_while_stopped() {
        let mut core = core();
        core.schedule(every(0.25), 0.0, TimeUnit::Beats).unwrap();
        assert!(core.next_firing(10.0).is_none());
        assert_eq!(core.queued(), 1);
    }

    #[test]
    fn test_fire_and_reschedule() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        let id = core.schedule(every(0.25), 0.0, TimeUnit::Beats).unwrap();

        let (current, desired, info) = fire(&mut core, 0.0).unwrap();
        assert_eq!(current.offset, 0.0);
        assert_eq!(desired.offset, 0.0);
        assert_eq!(info.invocations, 0);
        assert!(fire(&mut core, 0.0).is_none());

        // Due at 0.5s; slop lets it fire 1ms early but no earlier
        assert!(fire(&mut core, 0.498).is_none());
        let (_, desired, info) = fire(&mut core, 0.4995).unwrap();
        assert_eq!(desired.offset, 0.25);
        assert!((desired.seconds - 0.5).abs() < 1e-12);
        assert_eq!(info.id, id);
        assert_eq!(info.invocations, 1);
    }

    #[test]
    fn test_cancel_in_flight() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        let id = core.schedule(every(0.25), 0.0, TimeUnit::Beats).unwrap();

        let mut firing = core.next_firing(0.0).unwrap();
        assert!(core.cancel(id));
        assert!(!core.cancel(id));
        let result = firing.invoke();
        core.finish(firing, result);

        assert!(!core.is_queued(id));
        assert!(!core.cancel(id));
        assert!(!core.cancel(EventId(99)));
    }

    #[test]
    fn test_cancel_survives_overlapping_runs() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        let first = core.schedule(every(0.25), 0.0, TimeUnit::Beats).unwrap();
        let second = core.schedule(every(0.25), 0.0, TimeUnit::Beats).unwrap();

        // Stopped and restarted while the first callback is still running
        let mut old = core.next_firing(0.0).unwrap();
        core.stop();
        core.start(0.0, &StartOptions::default()).unwrap();
        let mut new = core.next_firing(0.0).unwrap();
        assert_eq!(new.info.id, second);
        assert!(core.cancel(second));

        let result = old.invoke();
        core.finish(old, result);
        let result = new.invoke();
        core.finish(new, result);

        assert!(core.is_queued(first));
        assert!(!core.is_queued(second));
    }

    fn every_measures(delta: f64) -> Proc {
        procedure(move |_, _, _| Ok(Action::after_measures(delta)))
    }

    #[test]
    fn test_measure_delta_keeps_position_in_measure() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        core.schedule(every_measures(1.0), 0.25, TimeUnit::Beats).unwrap();

        let (_, desired, _) = fire(&mut core, 0.5).unwrap();
        assert_eq!(desired.offset, 0.25);
        assert_eq!(desired.measure_offset, 0.25);
        let next = core.peek().unwrap();
        assert!((next.offset - 1.25).abs() < 1e-10);
        assert_eq!(next.measure, 2);
        assert!((next.measure_offset - 0.25).abs() < 1e-10);
    }

    #[test]
    fn test_fractional_measure_delta_moves_forward() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        core.schedule(every_measures(0.5), 0.75, TimeUnit::Beats).unwrap();

        // 0.75 is due at 1.5s; the next firing is half a measure later
        let mut fired = Vec::new();
        while let Some((_, desired, _)) = fire(&mut core, 1.5) {
            fired.push(desired.offset);
            assert!(fired.len() < 10, "refired {:?}", fired);
        }
        assert_eq!(fired, vec![0.75]);
        let next = core.peek().unwrap();
        assert!((next.offset - 1.25).abs() < 1e-10);
        assert!((next.seconds - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_failures_are_terminal() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        core.schedule(procedure(|_, _, _| Err("boom".into())), 0.0, TimeUnit::Beats)
            .unwrap();
        core.schedule(procedure(|_, _, _| panic!("kaboom")), 0.0, TimeUnit::Beats)
            .unwrap();
        core.schedule(every(0.0), 0.0, TimeUnit::Beats).unwrap();

        let mut fired = 0;
        while fire(&mut core, 0.0).is_some() {
            fired += 1;
        }
        assert_eq!(fired, 3);
        assert_eq!(core.queued(), 0);
    }

    #[test]
    fn test_panic_message_is_reported() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        core.schedule(procedure(|_, _, _| panic!("kaboom")), 0.0, TimeUnit::Beats)
            .unwrap();
        let mut firing = core.next_firing(0.0).unwrap();
        let err = firing.invoke().unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        core.finish(firing, Err(err));
    }

    #[test]
    fn test_reschedule_and_peek() {
        let mut core = core();
        let id = core.schedule(every(1.0), 1.0, TimeUnit::Beats).unwrap();
        assert_eq!(core.peek().map(|m| m.seconds), Some(2.0));

        assert!(core.reschedule(id, 0.5, TimeUnit::Beats).unwrap());
        assert_eq!(core.peek().map(|m| m.seconds), Some(1.0));
        assert!(!core.reschedule(EventId(42), 0.5, TimeUnit::Beats).unwrap());
        assert!(matches!(
            core.reschedule(id, f64::NAN, TimeUnit::Beats),
            Err(ClockError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_change_while_stopped_applies_immediately() {
        let mut core = core();
        let ts = TimeSignature::new(3, 4).unwrap();
        let id = core
            .change(TempoChange::tempo(90.0).with_signature(ts), 0.0)
            .unwrap();
        assert!(id.is_none());
        assert_eq!(core.beats_per_minute(), 90.0);
        assert_eq!(core.time_signature(), ts);
        assert!(core.change(TempoChange::tempo(-5.0), 0.0).is_err());
    }

    #[test]
    fn test_change_while_running_is_committed_by_engine() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        let id = core.change(TempoChange::tempo(60.0), 0.5).unwrap();
        assert!(id.is_some());
        assert_eq!(core.beats_per_minute(), 120.0);

        assert!(core.next_firing(0.5).is_none());
        assert_eq!(core.beats_per_minute(), 60.0);
        assert!((core.tempo_map().offset_to_seconds(0.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_stop_keeps_queue_and_restart_rekeys() {
        let mut core = core();
        core.start(0.0, &StartOptions::default()).unwrap();
        core.schedule(every(0.25), 1.0, TimeUnit::Beats).unwrap();
        core.stop();
        core.stop();
        assert_eq!(core.generation(), 2);
        assert_eq!(core.queued(), 1);

        core.start(10.0, &StartOptions::default()).unwrap();
        assert_eq!(core.next_due(), Some(12.0));
    }

    #[test]
    fn test_start_options() {
        let mut core = core();
        let options = StartOptions {
            initial_offset: 2.0,
            initial_measure: 5,
            beats_per_minute: Some(60.0),
            time_signature: None,
        };
        core.start(1.0, &options).unwrap();
        let now = core.reference_moment(1.0);
        assert_eq!(now.offset, 2.0);
        assert_eq!(now.measure, 5);
        assert_eq!(now.beats_per_minute, 60.0);
    }

    #[test]
    fn test_invalid_cue() {
        let mut core = core();
        assert!(matches!(
            core.cue(every(1.0), Some("1/4Q"), 0.0),
            Err(ClockError::InvalidQuantization(_))
        ));
        assert_eq!(core.queued(), 0);
    }
}
