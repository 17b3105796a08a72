//! NXP MAG3110 three-axis magnetometer over I2C.
//! Generic over any `embedded_hal::i2c::I2c` bus; on the board it runs on
//! `linux_embedded_hal::I2cdev` (`/dev/i2c-N`).

use crate::calibrate::{CALIBRATION_TIMEOUT, OffsetTracker};
use crate::sensor::{self, Axis, CalibrationOffsets, DataRate, Magnetometer, Sample};
use embedded_hal::i2c::I2c;
use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const ADDRESS: u8 = 0x0E;
pub const WHO_AM_I_VALUE: u8 = 0xC4;

pub mod registers {
    pub const DR_STATUS: u8 = 0x00;
    pub const OUT_X_MSB: u8 = 0x01;
    pub const WHO_AM_I: u8 = 0x07;
    pub const OFF_X_MSB: u8 = 0x09;
    pub const OFF_Y_MSB: u8 = 0x0B;
    pub const OFF_Z_MSB: u8 = 0x0D;
    pub const CTRL_REG1: u8 = 0x10;
    pub const CTRL_REG2: u8 = 0x11;

    /// DR_STATUS: new X, Y and Z data available.
    pub const ZYXDR: u8 = 0x08;
    /// CTRL_REG1: active mode.
    pub const AC: u8 = 0x01;
    /// CTRL_REG1: trigger immediate measurement.
    pub const TM: u8 = 0x02;
    /// CTRL_REG1: lower 3 bits, everything above is DR_OS.
    pub const MODE_MASK: u8 = 0x07;
    /// CTRL_REG2: automatic magnetic sensor reset.
    pub const AUTO_MRST_EN: u8 = 0x80;
    /// CTRL_REG2: report readings without user offsets applied.
    pub const RAW: u8 = 0x20;
}

use registers::*;

/// Time the part needs after a DR_OS change before it is switched back on.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum Mag3110Error<E: Debug> {
    #[error("i2c bus error: {0:?}")]
    Bus(E),
    #[error("unexpected WHO_AM_I 0x{0:02X} (expected 0xC4), not a MAG3110?")]
    WrongDevice(u8),
}

impl DataRate {
    /// DR_OS field of CTRL_REG1 (bits 7..3).
    fn dr_os_bits(self) -> u8 {
        match self {
            DataRate::Hz80Os16 => 0x00,
        }
    }
}

impl Axis {
    fn offset_register(self) -> u8 {
        match self {
            Axis::X => OFF_X_MSB,
            Axis::Y => OFF_Y_MSB,
            Axis::Z => OFF_Z_MSB,
        }
    }
}

pub struct Mag3110<I2C> {
    i2c: I2C,
    active: bool,
    calibration_timeout: Duration,
    settle_delay: Duration,
}

impl<I2C, E> Mag3110<I2C>
where
    I2C: I2c<Error = E>,
    E: Debug,
{
    /// Takes the bus and checks that a MAG3110 answers on it.
    pub fn new(i2c: I2C) -> Result<Self, Mag3110Error<E>> {
        let mut mag = Self {
            i2c,
            active: false,
            calibration_timeout: CALIBRATION_TIMEOUT,
            settle_delay: SETTLE_DELAY,
        };
        let id = mag.read_register(WHO_AM_I)?;
        if id != WHO_AM_I_VALUE {
            return Err(Mag3110Error::WrongDevice(id));
        }
        Ok(mag)
    }

    #[cfg(test)]
    fn with_calibration_timeout(mut self, timeout: Duration) -> Self {
        self.calibration_timeout = timeout;
        self
    }

    #[cfg(test)]
    fn without_settle_delay(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self
    }

    fn read_register(&mut self, register: u8) -> Result<u8, Mag3110Error<E>> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(ADDRESS, &[register], &mut buf)
            .map_err(Mag3110Error::Bus)?;
        Ok(buf[0])
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Mag3110Error<E>> {
        self.i2c
            .write(ADDRESS, &[register, value])
            .map_err(Mag3110Error::Bus)
    }

    fn read_word(&mut self, msb_register: u8) -> Result<i16, Mag3110Error<E>> {
        let mut buf = [0u8; 2];
        self.i2c
            .write_read(ADDRESS, &[msb_register], &mut buf)
            .map_err(Mag3110Error::Bus)?;
        Ok(i16::from_be_bytes(buf))
    }

    fn standby(&mut self) -> Result<(), Mag3110Error<E>> {
        let ctrl = self.read_register(CTRL_REG1)?;
        self.write_register(CTRL_REG1, ctrl & !(AC | TM))?;
        self.active = false;
        Ok(())
    }

    fn activate(&mut self) -> Result<(), Mag3110Error<E>> {
        let ctrl = self.read_register(CTRL_REG1)?;
        self.write_register(CTRL_REG1, ctrl | AC)?;
        self.active = true;
        Ok(())
    }

    fn set_raw_mode(&mut self, raw: bool) -> Result<(), Mag3110Error<E>> {
        let value = if raw { AUTO_MRST_EN | RAW } else { AUTO_MRST_EN };
        self.write_register(CTRL_REG2, value)
    }

    /// The offset registers hold the value shifted left by one bit.
    fn write_offset(&mut self, axis: Axis, offset: i16) -> Result<(), Mag3110Error<E>> {
        let [msb, lsb] = offset.wrapping_shl(1).to_be_bytes();
        self.i2c
            .write(ADDRESS, &[axis.offset_register(), msb, lsb])
            .map_err(Mag3110Error::Bus)
    }

    fn write_offsets(&mut self, offsets: CalibrationOffsets) -> Result<(), Mag3110Error<E>> {
        self.write_offset(Axis::X, offsets.x)?;
        self.write_offset(Axis::Y, offsets.y)?;
        self.write_offset(Axis::Z, offsets.z)
    }
}

impl<I2C, E> Magnetometer for Mag3110<I2C>
where
    I2C: I2c<Error = E>,
    E: Debug + Send + Sync + 'static,
{
    type Error = Mag3110Error<E>;

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.standby()?;
        self.write_register(CTRL_REG1, 0x00)?;
        self.write_register(CTRL_REG2, AUTO_MRST_EN)?;
        self.write_offsets(CalibrationOffsets::default())
    }

    fn calibration_loop(&mut self) -> Result<CalibrationOffsets, Self::Error> {
        self.reset()?;
        self.set_sample_rate(DataRate::Hz80Os16)?;
        self.set_raw_mode(true)?;
        self.start()?;

        let mut tracker = OffsetTracker::new(self.calibration_timeout, Instant::now());
        loop {
            sensor::wait_for_data(self)?;
            let sample = self.read_axes()?;
            if tracker.observe(sample, Instant::now()) {
                break;
            }
        }

        let offsets = tracker.offsets();
        log::debug!("calibration settled after {} samples", tracker.samples());
        self.write_offsets(offsets)?;
        self.set_raw_mode(false)?;
        self.standby()?;
        Ok(offsets)
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        self.activate()
    }

    /// DR_OS can only change in standby, so an active part is paused around the write.
    fn set_sample_rate(&mut self, rate: DataRate) -> Result<(), Self::Error> {
        let was_active = self.active;
        if was_active {
            self.standby()?;
            thread::sleep(self.settle_delay);
        }
        let mode = self.read_register(CTRL_REG1)? & MODE_MASK;
        self.write_register(CTRL_REG1, mode | (rate.dr_os_bits() << 3))?;
        if was_active {
            thread::sleep(self.settle_delay);
            self.activate()?;
        }
        Ok(())
    }

    fn data_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.read_register(DR_STATUS)? & ZYXDR != 0)
    }

    fn read_axes(&mut self) -> Result<Sample, Self::Error> {
        let mut buf = [0u8; 6];
        self.i2c
            .write_read(ADDRESS, &[OUT_X_MSB], &mut buf)
            .map_err(Mag3110Error::Bus)?;
        Ok(Sample::new(
            i16::from_be_bytes([buf[0], buf[1]]),
            i16::from_be_bytes([buf[2], buf[3]]),
            i16::from_be_bytes([buf[4], buf[5]]),
        ))
    }

    fn read_offset(&mut self, axis: Axis) -> Result<i16, Self::Error> {
        Ok(self.read_word(axis.offset_register())? >> 1)
    }
}
