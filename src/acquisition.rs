//! Acquisition loop: read, emit, pause, forever.
//! Runs on its own (blocking) thread and owns the sensor session outright.

use crate::output::OutputPipeline;
use crate::sensor::{Magnetometer, SensorSession};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Pause between samples, on top of the data-ready wait inside `read`.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

pub struct AcquisitionLoop<'a, M> {
    session: SensorSession<M>,
    output: &'a OutputPipeline,
    verbose: bool,
    interval: Duration,
    stop: Arc<AtomicBool>,
}

impl<'a, M: Magnetometer> AcquisitionLoop<'a, M> {
    /// `session` must already be started.
    pub fn new(session: SensorSession<M>, output: &'a OutputPipeline, verbose: bool) -> Self {
        Self {
            session,
            output,
            verbose,
            interval: SAMPLE_INTERVAL,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Flag checked between iterations; set it to make `run` return.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Samples until the stop flag is raised. Returns the number of samples taken.
    /// A sensor fault ends the loop with its error.
    pub fn run(&mut self) -> Result<u64, M::Error> {
        let mut count = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            self.step()?;
            count += 1;
        }
        log::info!("acquisition stopped after {} samples", count);
        Ok(count)
    }

    #[cfg(test)]
    pub fn run_for(&mut self, samples: u64) -> Result<(), M::Error> {
        for _ in 0..samples {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), M::Error> {
        let sample = self.session.read()?;
        self.output.emit(sample, self.verbose);
        thread::sleep(self.interval);
        Ok(())
    }

    #[cfg(test)]
    pub fn into_session(self) -> SensorSession<M> {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SinkReport;
    use crate::output::testing::MemorySink;
    use crate::pattern::{DataPattern, LogEntryPattern};
    use crate::sensor::testing::ScriptedMagnetometer;
    use crate::sensor::{CalibrationOffsets, Sample};

    fn started(samples: impl IntoIterator<Item = Sample>) -> SensorSession<ScriptedMagnetometer> {
        let mut session = SensorSession::new(ScriptedMagnetometer::with_samples(samples));
        session.initialize().unwrap();
        session.start().unwrap();
        session
    }

    fn pipeline(sink: &MemorySink) -> OutputPipeline {
        OutputPipeline::with_writer(
            sink.clone(),
            DataPattern::parse("{},{},{}").unwrap(),
            Some(LogEntryPattern::parse("%v")),
        )
    }

    #[tokio::test]
    async fn test_samples_flow_in_acquisition_order() {
        let sink = MemorySink::default();
        let output = pipeline(&sink);
        let samples = [Sample::new(10, -5, 200), Sample::new(0, 0, 0), Sample::new(-1, 2, -3)];

        let mut acquisition = AcquisitionLoop::new(started(samples), &output, false)
            .with_interval(Duration::ZERO);
        acquisition.run_for(3).unwrap();
        let session = acquisition.into_session();
        assert!(session.device().samples.is_empty());

        output.shutdown().await;
        assert_eq!(sink.lines(), ["10,-5,200", "0,0,0", "-1,2,-3"]);
    }

    #[tokio::test]
    async fn test_write_fault_does_not_stop_sampling() {
        let sink = MemorySink::failing_on([2]);
        let output = pipeline(&sink);
        let samples = (1..=4).map(|x| Sample::new(x, x, x));

        let mut acquisition = AcquisitionLoop::new(started(samples), &output, false)
            .with_interval(Duration::ZERO);
        acquisition.run_for(4).unwrap();
        drop(acquisition);

        let report = output.shutdown().await;
        assert_eq!(report, SinkReport { records_written: 3, write_failures: 1 });
        assert_eq!(sink.lines(), ["1,1,1", "3,3,3", "4,4,4"]);
    }

    #[tokio::test]
    async fn test_offsets_reported_once_before_samples() {
        let sink = MemorySink::default();
        let output = pipeline(&sink);
        let mut device = ScriptedMagnetometer::with_samples([Sample::new(5, 6, 7), Sample::new(8, 9, 10)]);
        device.calibration_result = CalibrationOffsets { x: -20, y: 31, z: 4 };

        let mut session = SensorSession::new(device);
        session.initialize().unwrap();
        session.calibrate().unwrap();
        session.start().unwrap();
        output.record_provenance(session.is_calibrated(), session.reported_offsets().unwrap());

        let mut acquisition = AcquisitionLoop::new(session, &output, false).with_interval(Duration::ZERO);
        acquisition.run_for(2).unwrap();
        let session = acquisition.into_session();
        assert_eq!(session.offsets(), CalibrationOffsets { x: -20, y: 31, z: 4 });

        output.shutdown().await;
        assert_eq!(
            sink.lines(),
            [
                "Calibration:true, offset x: -20, offset y: 31, offset z: 4",
                "5,6,7",
                "8,9,10",
            ]
        );
    }

    #[tokio::test]
    async fn test_run_returns_when_stopped() {
        let sink = MemorySink::default();
        let output = pipeline(&sink);
        let stop = Arc::new(AtomicBool::new(true));

        let mut acquisition = AcquisitionLoop::new(started([Sample::new(1, 1, 1)]), &output, true)
            .with_stop_flag(stop.clone());
        assert_eq!(acquisition.run().unwrap(), 0);

        stop.store(false, Ordering::Relaxed);
        let stopper = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stopper.store(true, Ordering::Relaxed);
        });
        let taken = acquisition.run().unwrap();
        handle.join().unwrap();
        assert!(taken >= 1, "took {taken} samples");
        drop(acquisition);
        output.shutdown().await;
    }
}
