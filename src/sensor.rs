//! Sensor session.
//! `Magnetometer` is the capability set the acquisition core needs from a driver;
//! `SensorSession` owns one driver and walks it through
//! reset -> (calibration) -> start -> sampling, in that order.

use std::fmt;
use std::thread;
use std::time::Duration;

/// Fixed data-ready poll step. The conversion cadence is fixed and short, so no backoff.
pub const READY_POLL_INTERVAL: Duration = Duration::from_micros(250);

/// One raw three-axis reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Sample {
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }

    pub const fn axes(&self) -> [i16; 3] {
        [self.x, self.y, self.z]
    }
}

/// Hard-iron offsets, one per axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CalibrationOffsets {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Output data rate / oversampling setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRate {
    /// 80 Hz output, 16x oversampling.
    Hz80Os16,
}

/// Driver capabilities consumed by the session. Opening the device is the
/// driver's constructor; everything after that goes through this trait.
pub trait Magnetometer {
    type Error: std::error::Error + Send + Sync + 'static;

    fn reset(&mut self) -> Result<(), Self::Error>;
    /// Blocks until offsets are acquired and written to the device.
    fn calibration_loop(&mut self) -> Result<CalibrationOffsets, Self::Error>;
    fn start(&mut self) -> Result<(), Self::Error>;
    fn set_sample_rate(&mut self, rate: DataRate) -> Result<(), Self::Error>;
    fn data_ready(&mut self) -> Result<bool, Self::Error>;
    fn read_axes(&mut self) -> Result<Sample, Self::Error>;
    fn read_offset(&mut self, axis: Axis) -> Result<i16, Self::Error>;
}

/// Busy-waits in fixed steps until the device reports a fresh reading.
/// There is no timeout: a device that never signals blocks forever.
pub fn wait_for_data<M: Magnetometer + ?Sized>(device: &mut M) -> Result<(), M::Error> {
    while !device.data_ready()? {
        thread::sleep(READY_POLL_INTERVAL);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Calibrating,
    Running,
    Sampling,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Calibrating => "calibrating",
            SessionState::Running => "running",
            SessionState::Sampling => "sampling",
        };
        f.write_str(name)
    }
}

pub struct SensorSession<M> {
    device: M,
    state: SessionState,
    rate: DataRate,
    offsets: Option<CalibrationOffsets>,
}

impl<M: Magnetometer> SensorSession<M> {
    pub fn new(device: M) -> Self {
        Self {
            device,
            state: SessionState::Uninitialized,
            rate: DataRate::Hz80Os16,
            offsets: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Hardware reset. Must precede calibration and sampling.
    pub fn initialize(&mut self) -> Result<(), M::Error> {
        assert_eq!(
            self.state,
            SessionState::Uninitialized,
            "sensor session initialized twice"
        );
        self.device.reset()?;
        self.state = SessionState::Initialized;
        log::debug!("magnetometer reset");
        Ok(())
    }

    /// Runs the blocking offset acquisition once and keeps the result for the session.
    pub fn calibrate(&mut self) -> Result<CalibrationOffsets, M::Error> {
        assert_eq!(
            self.state,
            SessionState::Initialized,
            "calibration is only possible right after initialization (state: {})",
            self.state
        );
        self.state = SessionState::Calibrating;
        log::info!("calibration started, rotate the sensor through all orientations");
        let offsets = self.device.calibration_loop()?;
        log::info!(
            "calibration done, offsets x: {}, y: {}, z: {}",
            offsets.x,
            offsets.y,
            offsets.z
        );
        self.offsets = Some(offsets);
        Ok(offsets)
    }

    /// Enables continuous conversion at the session's rate.
    pub fn start(&mut self) -> Result<(), M::Error> {
        assert!(
            matches!(
                self.state,
                SessionState::Initialized | SessionState::Calibrating
            ),
            "sensor started from state {}",
            self.state
        );
        self.device.start()?;
        self.device.set_sample_rate(self.rate)?;
        self.state = SessionState::Running;
        Ok(())
    }

    pub fn is_calibrated(&self) -> bool {
        self.offsets.is_some()
    }

    /// Offsets acquired by `calibrate`.
    ///
    /// # Panics
    /// If calibration has not run in this session.
    pub fn offsets(&self) -> CalibrationOffsets {
        match self.offsets {
            Some(offsets) => offsets,
            None => panic!("calibration offsets requested before calibration ran"),
        }
    }

    /// Offsets to report in the data log: the acquired ones after calibration,
    /// otherwise whatever the device's offset registers hold.
    pub fn reported_offsets(&mut self) -> Result<CalibrationOffsets, M::Error> {
        if self.is_calibrated() {
            return Ok(self.offsets());
        }
        Ok(CalibrationOffsets {
            x: self.device.read_offset(Axis::X)?,
            y: self.device.read_offset(Axis::Y)?,
            z: self.device.read_offset(Axis::Z)?,
        })
    }

    /// Blocks until data-ready, then returns the raw reading.
    pub fn read(&mut self) -> Result<Sample, M::Error> {
        assert!(
            matches!(self.state, SessionState::Running | SessionState::Sampling),
            "sensor read before start (state: {})",
            self.state
        );
        self.state = SessionState::Sampling;
        wait_for_data(&mut self.device)?;
        self.device.read_axes()
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &M {
        &self.device
    }
}
