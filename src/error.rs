//! Errors surfaced synchronously to callers of the clock.

/// Usage errors. The clock's state is unchanged when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("clock is already running")]
    AlreadyRunning,
    #[error("slop must be a positive, finite number of seconds (got {0})")]
    InvalidSlop(f64),
    #[error("invalid quantization {0:?}")]
    InvalidQuantization(String),
    #[error("invalid time signature {numerator}/{denominator}")]
    InvalidTimeSignature { numerator: u32, denominator: u32 },
    #[error("tempo must be a positive, finite number of beats per minute (got {0})")]
    InvalidTempo(f64),
    #[error("schedule time must be finite (got {0})")]
    InvalidTime(f64),
    #[error("failed to spawn clock worker: {0}")]
    Spawn(#[from] std::io::Error),
}
