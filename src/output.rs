//! Output pipeline.
//! Records are formatted on the caller's thread (timestamp included) and queued;
//! a tokio task drains the queue into the data log in FIFO order, so a slow disk
//! never stalls sampling. A failed write is logged, counted and skipped.
//! The queue is bounded: when the disk falls that far behind, new records are
//! dropped (and counted) instead of blocking the sampler.

use crate::pattern::{DataPattern, LogEntryPattern};
use crate::sensor::{CalibrationOffsets, Sample};
use chrono::Local;
use log::Level;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Name shown by `%n` in the record layout.
pub const LOGGER_NAME: &str = "async_file_logger";
/// Records waiting for the writer before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 8192;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open data log '{}'", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("data log write failed: {0}")]
    Write(io::Error),
}

/// What the pipeline did over its lifetime. Records dropped on a full queue
/// count as write failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub records_written: u64,
    pub write_failures: u64,
}

pub struct OutputPipeline {
    data_pattern: DataPattern,
    entry_pattern: LogEntryPattern,
    queue: mpsc::Sender<String>,
    writer: JoinHandle<SinkReport>,
    dropped: AtomicU64,
    echo_failed: AtomicBool,
}

impl OutputPipeline {
    /// Opens (appends to) the data log, creating missing directories.
    /// Must be called inside a tokio runtime.
    pub async fn open(
        path: &Path,
        data_pattern: DataPattern,
        entry_pattern: Option<LogEntryPattern>,
    ) -> Result<Self, SinkError> {
        let open_error = |source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(open_error)?;
        log::info!("data log opened: {}", path.display());
        Ok(Self::with_writer(BufWriter::new(file), data_pattern, entry_pattern))
    }

    /// Spawns the writer task on the current tokio runtime.
    pub fn with_writer<W>(
        writer: W,
        data_pattern: DataPattern,
        entry_pattern: Option<LogEntryPattern>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_queue(writer, QUEUE_CAPACITY, data_pattern, entry_pattern)
    }

    fn with_queue<W>(
        writer: W,
        capacity: usize,
        data_pattern: DataPattern,
        entry_pattern: Option<LogEntryPattern>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, records) = mpsc::channel(capacity);
        Self {
            data_pattern,
            entry_pattern: entry_pattern.unwrap_or_default(),
            queue,
            writer: tokio::spawn(write_records(writer, records)),
            dropped: AtomicU64::new(0),
            echo_failed: AtomicBool::new(false),
        }
    }

    /// First record of a run: where the offsets in effect came from.
    pub fn record_provenance(&self, calibrated: bool, offsets: CalibrationOffsets) {
        self.enqueue(&format!(
            "Calibration:{}, offset x: {}, offset y: {}, offset z: {}",
            calibrated, offsets.x, offsets.y, offsets.z
        ));
    }

    /// Queues one sample; with `verbose_echo` it is also printed right away.
    pub fn emit(&self, sample: Sample, verbose_echo: bool) {
        if verbose_echo {
            echo(&mut io::stdout().lock(), sample, &self.echo_failed);
        }
        self.enqueue(&self.data_pattern.render(sample.axes()));
    }

    fn enqueue(&self, message: &str) {
        let record = self
            .entry_pattern
            .render(&Local::now(), LOGGER_NAME, Level::Info, message);
        match self.queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    log::warn!("data log queue full, {} records dropped so far", dropped);
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("data log writer is gone, record dropped: {}", message);
            }
        }
    }

    /// Records that never reached the writer.
    #[cfg(test)]
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits until every queued record was handled.
    pub async fn shutdown(self) -> SinkReport {
        drop(self.queue);
        let mut report = match self.writer.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("data log writer task failed: {}", e);
                SinkReport::default()
            }
        };
        report.write_failures += self.dropped.into_inner();
        report
    }
}

/// Console echo never interrupts sampling; the first failure is reported once.
fn echo(out: &mut impl io::Write, sample: Sample, failed: &AtomicBool) {
    if let Err(e) = writeln!(out, "x: {} ,y: {},z: {} ", sample.x, sample.y, sample.z) {
        if !failed.swap(true, Ordering::Relaxed) {
            log::warn!("console echo failed, further failures are ignored: {}", e);
        }
    }
}

async fn write_records<W>(mut writer: W, mut records: mpsc::Receiver<String>) -> SinkReport
where
    W: AsyncWrite + Unpin,
{
    let mut report = SinkReport::default();
    while let Some(mut record) = records.recv().await {
        record.push('\n');
        match writer.write_all(record.as_bytes()).await {
            Ok(()) => report.records_written += 1,
            Err(e) => {
                report.write_failures += 1;
                log::error!("{}", SinkError::Write(e));
            }
        }
        // flush once the burst is written
        if records.is_empty() {
            if let Err(e) = writer.flush().await {
                log::error!("{}", SinkError::Write(e));
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::error!("{}", SinkError::Write(e));
    }
    report
}


#[cfg(test)]
mod tests {
    use super::testing::{MemorySink, StalledSink};
    use super::*;

    fn message_only() -> Option<LogEntryPattern> {
        Some(LogEntryPattern::parse("%v"))
    }

    #[tokio::test]
    async fn test_records_are_written_in_order() {
        let sink = MemorySink::default();
        let pipeline = OutputPipeline::with_writer(
            sink.clone(),
            DataPattern::parse("{},{},{}").unwrap(),
            message_only(),
        );

        pipeline.record_provenance(true, CalibrationOffsets { x: 12, y: -3, z: 450 });
        pipeline.emit(Sample::new(10, -5, 200), false);
        pipeline.emit(Sample::new(11, -6, 201), false);
        let report = pipeline.shutdown().await;

        assert_eq!(report, SinkReport { records_written: 3, write_failures: 0 });
        assert_eq!(
            sink.lines(),
            [
                "Calibration:true, offset x: 12, offset y: -3, offset z: 450",
                "10,-5,200",
                "11,-6,201",
            ]
        );
    }

    #[tokio::test]
    async fn test_default_record_layout() {
        let sink = MemorySink::default();
        let pipeline = OutputPipeline::with_writer(sink.clone(), DataPattern::default(), None);
        pipeline.emit(Sample::new(1, 2, 3), false);
        pipeline.shutdown().await;

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('['), "{}", lines[0]);
        assert!(
            lines[0].ends_with("] [async_file_logger] [info] 1 ,2, 3"),
            "{}",
            lines[0]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_skipped() {
        let sink = MemorySink::failing_on([2]);
        let pipeline = OutputPipeline::with_writer(
            sink.clone(),
            DataPattern::parse("{}").unwrap(),
            message_only(),
        );
        for x in 1..=4 {
            pipeline.emit(Sample::new(x, 0, 0), false);
        }
        let report = pipeline.shutdown().await;

        assert_eq!(report, SinkReport { records_written: 3, write_failures: 1 });
        assert_eq!(sink.lines(), ["1", "3", "4"]);
    }

    #[tokio::test]
    async fn test_stalled_sink_drops_instead_of_growing() {
        let pipeline = OutputPipeline::with_queue(StalledSink, 2, DataPattern::default(), message_only());
        for x in 1..=5 {
            pipeline.emit(Sample::new(x, 0, 0), false);
        }
        assert_eq!(pipeline.dropped_records(), 3);
    }

    #[tokio::test]
    async fn test_dropped_records_are_reported_as_failures() {
        let sink = MemorySink::default();
        let pipeline =
            OutputPipeline::with_queue(sink.clone(), 1, DataPattern::parse("{}").unwrap(), message_only());
        for x in 1..=3 {
            pipeline.emit(Sample::new(x, 0, 0), false);
        }
        let report = pipeline.shutdown().await;

        assert_eq!(report, SinkReport { records_written: 1, write_failures: 2 });
        assert_eq!(sink.lines(), ["1"]);
    }

    #[test]
    fn test_echo_failure_is_reported_once() {
        struct BrokenPipe;
        impl io::Write for BrokenPipe {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let failed = AtomicBool::new(false);
        let mut out = Vec::new();
        echo(&mut out, Sample::new(1, -2, 3), &failed);
        assert_eq!(out, b"x: 1 ,y: -2,z: 3 \n");
        assert!(!failed.load(Ordering::Relaxed));

        echo(&mut BrokenPipe, Sample::new(1, 2, 3), &failed);
        echo(&mut BrokenPipe, Sample::new(4, 5, 6), &failed);
        assert!(failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_open_creates_directory_and_appends() {
        let dir = std::env::temp_dir().join(format!("rpimag-output-{}", std::process::id()));
        let path = dir.join("nested").join("mag_log_test.txt");

        for x in [1, 2] {
            let pipeline = OutputPipeline::open(&path, DataPattern::parse("{}").unwrap(), message_only())
                .await
                .unwrap();
            pipeline.emit(Sample::new(x, 0, 0), false);
            pipeline.shutdown().await;
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(contents, "1\n2\n");
    }

    #[tokio::test]
    async fn test_open_fails_when_parent_is_a_file() {
        let blocker = std::env::temp_dir().join(format!("rpimag-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = OutputPipeline::open(&blocker.join("mag_log.txt"), DataPattern::default(), None).await;
        std::fs::remove_file(&blocker).unwrap();

        match result {
            Err(SinkError::Open { path, .. }) => assert!(path.ends_with("mag_log.txt")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opening below a regular file should fail"),
        }
    }
}
