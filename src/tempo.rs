//! Tempo Map - piecewise-constant tempo and time signature over offsets
//!
//! Provides conversions between offsets, seconds and (measure, measure offset)
//! under a tempo and time signature that change at discrete points.

use crate::error::ClockError;
use crate::moment::{Moment, TimeSignature};

/// Tolerance for snapping measure positions onto downbeats.
pub(crate) const EPSILON: f64 = 1e-9;

/// Seconds per whole note at one quarter note per minute.
const SECONDS_PER_WHOLE_NOTE_AT_1_BPM: f64 = 240.0;

/// A requested tempo and/or time signature change. Unset fields carry over.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TempoChange {
    pub beats_per_minute: Option<f64>,
    pub time_signature: Option<TimeSignature>,
}

impl TempoChange {
    pub fn tempo(beats_per_minute: f64) -> Self {
        Self {
            beats_per_minute: Some(beats_per_minute),
            time_signature: None,
        }
    }

    pub fn signature(time_signature: TimeSignature) -> Self {
        Self {
            beats_per_minute: None,
            time_signature: Some(time_signature),
        }
    }

    pub fn with_tempo(mut self, beats_per_minute: f64) -> Self {
        self.beats_per_minute = Some(beats_per_minute);
        self
    }

    pub fn with_signature(mut self, time_signature: TimeSignature) -> Self {
        self.time_signature = Some(time_signature);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.beats_per_minute.is_none() && self.time_signature.is_none()
    }

    pub(crate) fn validate(&self) -> Result<(), ClockError> {
        match self.beats_per_minute {
            Some(bpm) if !(bpm.is_finite() && bpm > 0.0) => Err(ClockError::InvalidTempo(bpm)),
            _ => Ok(()),
        }
    }

    /// `later` wins wherever it sets a field.
    fn merged(self, later: TempoChange) -> TempoChange {
        TempoChange {
            beats_per_minute: later.beats_per_minute.or(self.beats_per_minute),
            time_signature: later.time_signature.or(self.time_signature),
        }
    }
}

/// How a change landed in the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Commit {
    /// The change starts after every committed segment.
    Appended,
    /// The change predates committed segments, which were truncated and replayed.
    Regenerated { replayed: usize },
}

/// A constant-tempo, constant-signature stretch of the timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct TempoSegment {
    pub start_offset: f64,
    pub start_seconds: f64,
    /// Measure in progress at `start_offset`.
    pub start_measure: i64,
    /// Offset already elapsed in `start_measure` at `start_offset`.
    pub start_measure_offset: f64,
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
    /// The change that produced this segment, kept for regeneration.
    change: TempoChange,
}

impl TempoSegment {
    fn seconds_per_offset(&self) -> f64 {
        SECONDS_PER_WHOLE_NOTE_AT_1_BPM / self.beats_per_minute
    }

    fn seconds_at(&self, offset: f64) -> f64 {
        self.start_seconds + (offset - self.start_offset) * self.seconds_per_offset()
    }

    fn offset_at(&self, seconds: f64) -> f64 {
        self.start_offset + (seconds - self.start_seconds) / self.seconds_per_offset()
    }

    fn measure_at(&self, offset: f64) -> (i64, f64) {
        let len = self.time_signature.measure_length();
        let elapsed = offset - self.start_offset + self.start_measure_offset;
        let mut whole = (elapsed / len).floor();
        let mut remainder = elapsed - whole * len;
        if len - remainder < EPSILON {
            whole += 1.0;
            remainder = 0.0;
        } else if remainder.abs() < EPSILON {
            remainder = 0.0;
        }
        (self.start_measure + whole as i64, remainder)
    }

    /// Offset of the downbeat of `measure`, extrapolated with this segment's signature.
    fn downbeat(&self, measure: i64) -> f64 {
        self.start_offset - self.start_measure_offset
            + (measure - self.start_measure) as f64 * self.time_signature.measure_length()
    }
}

/// Ordered tempo segments. Grows as changes commit.
#[derive(Clone, Debug)]
pub struct TempoMap {
    pub version: u64,
    segs: Vec<TempoSegment>,
}

impl TempoMap {
    /// Create a map anchored at offset 0, measure 1, second 0.
    pub fn new(beats_per_minute: f64, time_signature: TimeSignature) -> Result<Self, ClockError> {
        let mut map = Self {
            version: 0,
            segs: Vec::with_capacity(1),
        };
        map.restart(0.0, 0.0, 1, Some(beats_per_minute), Some(time_signature))?;
        Ok(map)
    }

    /// Reset to a single segment at the given origin. Unset tempo fields keep
    /// the latest committed values.
    pub fn restart(
        &mut self,
        seconds: f64,
        offset: f64,
        measure: i64,
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
    ) -> Result<(), ClockError> {
        let latest = self.segs.last();
        let bpm = beats_per_minute
            .or(latest.map(|s| s.beats_per_minute))
            .ok_or(ClockError::InvalidTempo(f64::NAN))?;
        let ts = time_signature
            .or(latest.map(|s| s.time_signature))
            .unwrap_or_default();
        let change = TempoChange::tempo(bpm).with_signature(ts);
        change.validate()?;

        self.segs.clear();
        self.segs.push(TempoSegment {
            start_offset: offset,
            start_seconds: seconds,
            start_measure: measure,
            start_measure_offset: 0.0,
            beats_per_minute: bpm,
            time_signature: ts,
            change,
        });
        self.version += 1;
        Ok(())
    }

    /// Collapse to one segment at the current origin carrying the latest tempo
    /// and signature.
    pub fn collapse(&mut self) {
        if self.segs.len() <= 1 {
            return;
        }
        let origin = self.segs[0].clone();
        let latest = self.segs[self.segs.len() - 1].clone();
        self.segs.clear();
        self.segs.push(TempoSegment {
            beats_per_minute: latest.beats_per_minute,
            time_signature: latest.time_signature,
            change: TempoChange::tempo(latest.beats_per_minute)
                .with_signature(latest.time_signature),
            ..origin
        });
        self.version += 1;
    }

    /// Edit the first segment in place. Only meaningful while the map holds a
    /// single, uncommitted segment.
    pub fn amend_pending(&mut self, change: TempoChange) -> Result<(), ClockError> {
        change.validate()?;
        let seg = &mut self.segs[0];
        seg.change = seg.change.merged(change);
        if let Some(bpm) = change.beats_per_minute {
            seg.beats_per_minute = bpm;
        }
        if let Some(ts) = change.time_signature {
            seg.time_signature = ts;
        }
        self.version += 1;
        Ok(())
    }

    /// Commit a change at `offset`.
    ///
    /// Offsets at or before a committed segment truncate the map there, insert
    /// the change, and replay the truncated segments' own changes on top.
    pub fn apply_change(&mut self, offset: f64, change: TempoChange) -> Result<Commit, ClockError> {
        change.validate()?;
        let offset = offset.max(self.origin_offset());
        let split = self
            .segs
            .partition_point(|s| s.start_offset < offset - EPSILON)
            .max(1);

        let mut replay = self.segs.split_off(split);
        let mut change = change;
        if replay
            .first()
            .is_some_and(|s| (s.start_offset - offset).abs() < EPSILON)
        {
            change = replay.remove(0).change.merged(change);
        }

        let replayed = replay.len();
        if (self.segs[split - 1].start_offset - offset).abs() < EPSILON {
            // Lands on the origin: rewrite the first segment's settings.
            let seg = &mut self.segs[split - 1];
            seg.change = seg.change.merged(change);
            seg.beats_per_minute = change.beats_per_minute.unwrap_or(seg.beats_per_minute);
            seg.time_signature = change.time_signature.unwrap_or(seg.time_signature);
        } else {
            self.push_segment(offset, change);
        }
        for seg in replay {
            self.push_segment(seg.start_offset, seg.change);
        }
        self.version += 1;

        Ok(if replayed == 0 {
            Commit::Appended
        } else {
            Commit::Regenerated { replayed }
        })
    }

    /// Append a segment at `offset`, carrying unset fields from the last segment.
    fn push_segment(&mut self, offset: f64, change: TempoChange) {
        let prev = &self.segs[self.segs.len() - 1];
        let seconds = prev.seconds_at(offset);
        let (measure, measure_offset) = prev.measure_at(offset);
        let bpm = change.beats_per_minute.unwrap_or(prev.beats_per_minute);
        let ts = change.time_signature.unwrap_or(prev.time_signature);

        // A measure survives a signature change only if its elapsed part still
        // fits; otherwise the next measure starts at the change.
        let (start_measure, start_measure_offset) = if measure_offset < EPSILON {
            (measure, 0.0)
        } else if measure_offset < ts.measure_length() - EPSILON {
            (measure, measure_offset)
        } else {
            (measure + 1, 0.0)
        };

        self.segs.push(TempoSegment {
            start_offset: offset,
            start_seconds: seconds,
            start_measure,
            start_measure_offset,
            beats_per_minute: bpm,
            time_signature: ts,
            change,
        });
    }

    pub fn segments(&self) -> &[TempoSegment] {
        &self.segs
    }

    /// The latest committed segment.
    pub fn latest(&self) -> &TempoSegment {
        &self.segs[self.segs.len() - 1]
    }

    pub fn origin_offset(&self) -> f64 {
        self.segs[0].start_offset
    }

    pub fn origin_seconds(&self) -> f64 {
        self.segs[0].start_seconds
    }

    pub fn offset_to_seconds(&self, offset: f64) -> f64 {
        self.segment_for_offset(offset).seconds_at(offset)
    }

    pub fn seconds_to_offset(&self, seconds: f64) -> f64 {
        self.segment_for_seconds(seconds).offset_at(seconds)
    }

    pub fn offset_to_measure(&self, offset: f64) -> (i64, f64) {
        self.segment_for_offset(offset).measure_at(offset)
    }

    /// Offset of a (possibly fractional) measure position.
    pub fn measure_to_offset(&self, measure: f64) -> f64 {
        let whole = measure.floor();
        let fraction = measure - whole;
        let seg = self.segment_for_measure(whole as i64);
        seg.downbeat(whole as i64) + fraction * seg.time_signature.measure_length()
    }

    /// Fractional measure position of `offset`; the inverse of `measure_to_offset`.
    pub fn measure_position(&self, offset: f64) -> f64 {
        let (measure, _) = self.offset_to_measure(offset);
        let seg = self.segment_for_measure(measure);
        let fraction = (offset - seg.downbeat(measure)) / seg.time_signature.measure_length();
        if fraction.abs() < EPSILON {
            measure as f64
        } else {
            measure as f64 + fraction
        }
    }

    pub fn moment_at_offset(&self, offset: f64) -> Moment {
        let seg = self.segment_for_offset(offset);
        let (measure, measure_offset) = seg.measure_at(offset);
        Moment {
            offset,
            seconds: seg.seconds_at(offset),
            measure,
            measure_offset,
            beats_per_minute: seg.beats_per_minute,
            time_signature: seg.time_signature,
        }
    }

    pub fn moment_at_seconds(&self, seconds: f64) -> Moment {
        let seg = self.segment_for_seconds(seconds);
        let offset = seg.offset_at(seconds);
        let (measure, measure_offset) = seg.measure_at(offset);
        Moment {
            offset,
            seconds,
            measure,
            measure_offset,
            beats_per_minute: seg.beats_per_minute,
            time_signature: seg.time_signature,
        }
    }

    /// Last segment with `start_offset <= offset`, or the first one.
    fn segment_for_offset(&self, offset: f64) -> &TempoSegment {
        let idx = self.segs.partition_point(|s| s.start_offset <= offset);
        &self.segs[idx.saturating_sub(1)]
    }

    fn segment_for_seconds(&self, seconds: f64) -> &TempoSegment {
        let idx = self.segs.partition_point(|s| s.start_seconds <= seconds);
        &self.segs[idx.saturating_sub(1)]
    }

    fn segment_for_measure(&self, measure: i64) -> &TempoSegment {
        let idx = self.segs.partition_point(|s| s.start_measure <= measure);
        &self.segs[idx.saturating_sub(1)]
    }
}
