//! Quantization Resolver
//!
//! Grids are written `N/D` (step N/D whole notes), `N/DT` (triplet step) or
//! `NM` (every N measures, anchored at measure 1).

use crate::error::ClockError;
use crate::event::Target;
use crate::moment::Moment;
use crate::tempo::EPSILON;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Quantization {
    /// Grid of `step` offset units anchored at offset 0.
    Offset { step: f64 },
    /// Downbeat of every `every`-th measure, anchored at measure 1.
    Measures { every: u32 },
}

fn positive(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok().filter(|&n| n > 0)
}

impl FromStr for Quantization {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClockError::InvalidQuantization(s.to_string());
        let text = s.trim();

        if let Some(count) = text.strip_suffix('M') {
            let every = positive(count).ok_or_else(invalid)?;
            return Ok(Quantization::Measures { every });
        }

        let (text, triplet) = match text.strip_suffix('T') {
            Some(rest) => (rest, true),
            None => (text, false),
        };
        let (n, d) = text.split_once('/').ok_or_else(invalid)?;
        let n = positive(n).ok_or_else(invalid)?;
        let d = positive(d).ok_or_else(invalid)?;

        let mut step = n as f64 / d as f64;
        if triplet {
            step *= 2.0 / 3.0;
        }
        Ok(Quantization::Offset { step })
    }
}

impl Quantization {
    /// Smallest grid point at or after `reference`.
    pub fn resolve(&self, reference: &Moment) -> Target {
        match *self {
            Quantization::Offset { step } => {
                let ratio = reference.offset / step;
                let nearest = ratio.round();
                let k = if (ratio - nearest).abs() < EPSILON {
                    nearest
                } else {
                    ratio.ceil()
                };
                Target::Offset(k as i64 as f64 * step)
            }
            Quantization::Measures { every } => {
                let candidate = if reference.measure_offset.abs() < EPSILON {
                    reference.measure
                } else {
                    reference.measure + 1
                };
                let every = i64::from(every);
                let k = (candidate - 1 + every - 1).div_euclid(every);
                Target::Measure((1 + k * every) as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moment::TimeSignature;
    use crate::tempo::TempoMap;

    fn moment(offset: f64) -> Moment {
        TempoMap::new(120.0, TimeSignature::COMMON)
            .unwrap()
            .moment_at_offset(offset)
    }

    fn offset_of(target: Target) -> f64 {
        match target {
            Target::Offset(v) => v,
            other => panic!("expected offset target, got {other:?}"),
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "1/4".parse::<Quantization>().unwrap(),
            Quantization::Offset { step: 0.25 }
        );
        assert_eq!(
            "2M".parse::<Quantization>().unwrap(),
            Quantization::Measures { every: 2 }
        );
        let Quantization::Offset { step } = "1/2T".parse().unwrap() else {
            panic!("expected offset grid");
        };
        assert!((step - 1.0 / 3.0).abs() < 1e-12);

        for bad in ["", "M", "0M", "1/0", "1/", "/4", "a/4", "1/4X", "-1/4", "1.5/4"] {
            assert!(bad.parse::<Quantization>().is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_quarter_grid() {
        let q: Quantization = "1/4".parse().unwrap();
        assert_eq!(offset_of(q.resolve(&moment(0.0))), 0.0);
        assert_eq!(offset_of(q.resolve(&moment(0.1))), 0.25);
        assert_eq!(offset_of(q.resolve(&moment(0.25))), 0.25);
        assert_eq!(offset_of(q.resolve(&moment(0.0625))), 0.25);
    }

    #[test]
    fn test_triplet_grid() {
        let q: Quantization = "1/2T".parse().unwrap();
        assert!((offset_of(q.resolve(&moment(0.0625))) - 1.0 / 3.0).abs() < 1e-12);
        assert!((offset_of(q.resolve(&moment(0.375))) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_measure_grid() {
        let one: Quantization = "1M".parse().unwrap();
        assert_eq!(one.resolve(&moment(0.0)), Target::Measure(1.0));
        assert_eq!(one.resolve(&moment(0.0625)), Target::Measure(2.0));
        assert_eq!(one.resolve(&moment(1.0)), Target::Measure(2.0));

        let two: Quantization = "2M".parse().unwrap();
        assert_eq!(two.resolve(&moment(0.0625)), Target::Measure(3.0));
        // Measure 2 is not on a 2-measure grid anchored at 1
        assert_eq!(two.resolve(&moment(1.0)), Target::Measure(3.0));
        assert_eq!(two.resolve(&moment(2.0)), Target::Measure(3.0));
        assert_eq!(two.resolve(&moment(2.5)), Target::Measure(5.0));
    }
}
