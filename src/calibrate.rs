//! Calibration module.
//! Hard-iron offset acquisition: while the user rotates the sensor, track the
//! per-axis extremes; once no new extreme shows up for `timeout`, the offset of
//! each axis is the midpoint of its range.
//! The driver owns the hardware side (raw mode, writing offset registers).

use crate::sensor::{CalibrationOffsets, Sample};
use std::time::{Duration, Instant};

/// How long the extremes must stay unchanged before calibration ends.
pub const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct OffsetTracker {
    min: [i16; 3],
    max: [i16; 3],
    samples: u32,
    last_change: Instant,
    timeout: Duration,
}

impl OffsetTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            min: [i16::MAX; 3],
            max: [i16::MIN; 3],
            samples: 0,
            last_change: now,
            timeout,
        }
    }

    /// Feeds one raw reading. Returns true once the extremes have settled.
    pub fn observe(&mut self, sample: Sample, now: Instant) -> bool {
        let mut changed = false;
        for (axis, value) in sample.axes().into_iter().enumerate() {
            if value < self.min[axis] {
                self.min[axis] = value;
                changed = true;
            }
            if value > self.max[axis] {
                self.max[axis] = value;
                changed = true;
            }
        }
        self.samples += 1;
        if changed {
            self.last_change = now;
        }
        self.is_settled(now)
    }

    pub fn is_settled(&self, now: Instant) -> bool {
        self.samples > 0 && now.saturating_duration_since(self.last_change) > self.timeout
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Midpoint of each axis range. All zero before the first sample.
    pub fn offsets(&self) -> CalibrationOffsets {
        if self.samples == 0 {
            return CalibrationOffsets::default();
        }
        let mid = |axis: usize| ((i32::from(self.min[axis]) + i32::from(self.max[axis])) / 2) as i16;
        CalibrationOffsets {
            x: mid(0),
            y: mid(1),
            z: mid(2),
        }
    }
}
