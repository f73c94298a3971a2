//! Moments and time signatures
//!
//! Offsets are measured in whole notes: a 4/4 measure spans offset 1.0 and
//! `beats_per_minute` counts quarter notes.

use crate::error::ClockError;
use std::fmt;
use std::str::FromStr;

/// A time signature. The denominator is always a power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeSignature {
    numerator: u32,
    denominator: u32,
}

impl TimeSignature {
    pub const COMMON: TimeSignature = TimeSignature {
        numerator: 4,
        denominator: 4,
    };

    pub fn new(numerator: u32, denominator: u32) -> Result<Self, ClockError> {
        if numerator == 0 || !denominator.is_power_of_two() {
            return Err(ClockError::InvalidTimeSignature {
                numerator,
                denominator,
            });
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    /// Length of one measure in offset units (whole notes).
    pub fn measure_length(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Quarter-note beats per measure.
    pub fn beats_per_measure(&self) -> f64 {
        self.numerator as f64 * 4.0 / self.denominator as f64
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for TimeSignature {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClockError::InvalidTimeSignature {
            numerator: 0,
            denominator: 0,
        };
        let (n, d) = s.trim().split_once('/').ok_or_else(invalid)?;
        let n = n.trim().parse().map_err(|_| invalid())?;
        let d = d.trim().parse().map_err(|_| invalid())?;
        Self::new(n, d)
    }
}

/// Units for schedule positions and reschedule deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// Offset units (whole notes).
    #[default]
    Beats,
    Measures,
    Seconds,
}

/// A fully resolved point in musical and real time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moment {
    /// Whole notes since the clock's epoch.
    pub offset: f64,
    /// Time-source seconds.
    pub seconds: f64,
    /// 1-based measure number.
    pub measure: i64,
    /// Offset elapsed since the start of `measure`.
    pub measure_offset: f64,
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_signature_validation() {
        assert!(TimeSignature::new(3, 4).is_ok());
        assert!(TimeSignature::new(7, 8).is_ok());
        assert!(TimeSignature::new(0, 4).is_err());
        assert!(TimeSignature::new(4, 3).is_err());
        assert!(TimeSignature::new(4, 0).is_err());
    }

    #[test]
    fn test_measure_lengths() {
        let ts = TimeSignature::new(3, 4).unwrap();
        assert!((ts.measure_length() - 0.75).abs() < 1e-12);
        assert!((ts.beats_per_measure() - 3.0).abs() < 1e-12);

        let ts = TimeSignature::new(6, 8).unwrap();
        assert!((ts.measure_length() - 0.75).abs() < 1e-12);
        assert!((ts.beats_per_measure() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_and_display() {
        let ts: TimeSignature = " 5/4 ".parse().unwrap();
        assert_eq!(ts, TimeSignature::new(5, 4).unwrap());
        assert_eq!(ts.to_string(), "5/4");
        assert!("5".parse::<TimeSignature>().is_err());
        assert!("5/6".parse::<TimeSignature>().is_err());
    }
}
