//! Tempo Clock
//!
//! A musical-time scheduling clock with:
//! - Callbacks scheduled by offset, measure or seconds, rescheduled by their return value
//! - A tempo map that grows as tempo and time signature changes commit
//! - Quantized cues (`1/4`, `1/2T`, `2M`, ...)
//! - Dual execution models: a worker thread, or a cooperative single-threaded loop
//!   driven in realtime (spin_sleep) or offline on virtual time

pub mod moment;
pub mod tempo;
pub mod pq;
mod queue;
pub mod event;
pub mod quantize;
pub mod time;
pub mod scheduler;
pub mod threaded;
pub mod executor;
pub mod cooperative;
pub mod engine;
pub mod error;


pub use cooperative::CooperativeClock;
pub use engine::{OfflineRunner, RealtimeRunner};
pub use error::ClockError;
pub use event::{
    Action, CallbackError, CallbackResult, EventId, EventInfo, EventKind, LocalProcedure,
    Procedure, Target,
};
pub use executor::{Executor, TaskHandle};
pub use moment::{Moment, TimeSignature, TimeUnit};
pub use quantize::Quantization;
pub use scheduler::{ClockConfig, StartOptions};
pub use tempo::{Commit, TempoChange, TempoMap, TempoSegment};
pub use threaded::{ClockHandle, TempoClock};
pub use time::{MonotonicTime, TimeSource, VirtualTime};
