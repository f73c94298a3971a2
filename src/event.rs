//! Scheduled events and the callback contract.

use crate::moment::{Moment, TimeUnit};
use crate::tempo::TempoChange;
use std::fmt;

/// Identifies a scheduled event across all of its invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u64);

impl EventId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an event is due.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Target {
    /// Offset in whole notes. Follows tempo changes.
    Offset(f64),
    /// 1-based measure position; the fraction is a share of the measure.
    Measure(f64),
    /// Seconds after the clock's epoch. Unaffected by tempo changes.
    Seconds(f64),
}

impl Target {
    /// Build a target from a position expressed in `unit`.
    pub fn from_unit(at: f64, unit: TimeUnit) -> Target {
        match unit {
            TimeUnit::Beats => Target::Offset(at),
            TimeUnit::Measures => Target::Measure(at),
            TimeUnit::Seconds => Target::Seconds(at),
        }
    }

    /// Whether the due time moves when the tempo map changes.
    pub fn follows_tempo(&self) -> bool {
        !matches!(self, Target::Seconds(_))
    }
}

/// What a callback asks the clock to do next.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    Stop,
    Reschedule { delta: f64, unit: TimeUnit },
}

impl Action {
    pub fn after_beats(delta: f64) -> Action {
        Action::Reschedule {
            delta,
            unit: TimeUnit::Beats,
        }
    }

    pub fn after_measures(delta: f64) -> Action {
        Action::Reschedule {
            delta,
            unit: TimeUnit::Measures,
        }
    }

    pub fn after_seconds(delta: f64) -> Action {
        Action::Reschedule {
            delta,
            unit: TimeUnit::Seconds,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Callback,
    Change,
}

impl EventKind {
    /// Changes sort ahead of callbacks due at the same time.
    pub(crate) fn rank(self) -> u8 {
        match self {
            EventKind::Change => 0,
            EventKind::Callback => 1,
        }
    }
}

/// Metadata handed to a callback alongside its moments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventInfo {
    pub id: EventId,
    /// Completed invocations before this one.
    pub invocations: u64,
    pub target: Target,
    pub kind: EventKind,
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackResult = Result<Action, CallbackError>;

/// A callback for the threaded clock.
pub type Procedure = Box<dyn FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult + Send>;

/// A callback for the cooperative clock, which never leaves its thread.
pub type LocalProcedure = Box<dyn FnMut(&Moment, &Moment, &EventInfo) -> CallbackResult>;

pub(crate) enum Payload<P> {
    Callback(P),
    Change(TempoChange),
}

pub(crate) struct Event<P> {
    pub id: EventId,
    pub target: Target,
    pub invocations: u64,
    pub payload: Payload<P>,
}

impl<P> Event<P> {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            Payload::Callback(_) => EventKind::Callback,
            Payload::Change(_) => EventKind::Change,
        }
    }

    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            invocations: self.invocations,
            target: self.target,
            kind: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_unit() {
        assert_eq!(Target::from_unit(1.5, TimeUnit::Beats), Target::Offset(1.5));
        assert_eq!(Target::from_unit(3.0, TimeUnit::Measures), Target::Measure(3.0));
        assert_eq!(Target::from_unit(0.2, TimeUnit::Seconds), Target::Seconds(0.2));
        assert!(!Target::Seconds(1.0).follows_tempo());
        assert!(Target::Measure(1.0).follows_tempo());
    }

    #[test]
    fn test_change_outranks_callback() {
        assert!(EventKind::Change.rank() < EventKind::Callback.rank());
    }
}
