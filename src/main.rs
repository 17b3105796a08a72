mod acquisition;
mod calibrate;
mod config;
mod mag3110;
mod output;
mod pattern;
mod sensor;

use acquisition::AcquisitionLoop;
use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use config::{CliOverrides, Defaults, EffectiveConfig};
use linux_embedded_hal::I2cdev;
use mag3110::Mag3110;
use output::OutputPipeline;
use sensor::SensorSession;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn cli() -> Command {
    Command::new("rpimag")
        .about("Magnetometer data logger")
        .disable_help_flag(true)
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("DEVICE")
                .help("Name of i2c device (e.g. -d /dev/i2c-3)"),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Config file, if not set default_config.yaml is used"),
        )
        .arg(
            Arg::new("outsuffix")
                .short('o')
                .long("outsuffix")
                .value_name("SUFFIX")
                .help("Output file suffix"),
        )
        .arg(
            Arg::new("output_dir")
                .short('X')
                .long("output_dir")
                .value_name("DIR")
                .help("Output directory"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Print values"),
        )
        .arg(
            Arg::new("calibration")
                .short('c')
                .long("calibration")
                .action(ArgAction::SetTrue)
                .help("Run with calibration"),
        )
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::Help)
                .help("Print this help"),
        )
}

fn overrides(matches: &ArgMatches) -> CliOverrides {
    CliOverrides {
        device: matches.get_one::<String>("device").cloned(),
        settings_file: matches.get_one::<PathBuf>("file").cloned(),
        outsuffix: matches.get_one::<String>("outsuffix").cloned(),
        output_dir: matches.get_one::<String>("output_dir").cloned(),
        verbose: matches.get_flag("verbose"),
        calibration: matches.get_flag("calibration"),
    }
}

/// Warnings to the terminal, everything from info up to the error log file.
fn init_diagnostics(config: &EffectiveConfig) -> Result<()> {
    let path = config.error_log_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open error log {}", path.display()))?;

    let log_config = ConfigBuilder::new().build();
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            LevelFilter::Warn,
            log_config.clone(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, log_config, file),
    ];
    CombinedLogger::init(loggers).context("Failed to install logger")?;
    Ok(())
}

/// First interrupt asks the acquisition loop to stop after its current sample.
/// Returns true on a second one: the loop is stuck (waiting on the sensor or
/// calibrating) and the process should exit without draining the data log.
async fn watch_interrupts<F, Fut>(mut interrupted: F, stop: Arc<AtomicBool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(e) = interrupted().await {
        log::warn!("cannot listen for interrupts: {}", e);
        return false;
    }
    log::info!("interrupt received, stopping");
    stop.store(true, Ordering::Relaxed);
    if interrupted().await.is_err() {
        return false;
    }
    log::warn!("second interrupt, exiting without draining the data log");
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    // --help and parse errors exit here, before any settings are read
    let matches = cli().get_matches();
    let cli = overrides(&matches);

    let defaults = Defaults::default();
    let file = config::load_settings(cli.settings_path(&defaults))?;
    let config = config::resolve(&cli, &file, &defaults)?;

    init_diagnostics(&config)?;
    log::info!(
        "starting on {} (calibration: {}, data pattern '{}')",
        config.device_path,
        config.run_calibration,
        config.data_pattern.as_str()
    );

    let data_log = config.data_log_path();
    let output = OutputPipeline::open(
        &data_log,
        config.data_pattern.clone(),
        config.log_entry_pattern.clone(),
    )
    .await?;

    let stop = Arc::new(AtomicBool::new(false));
    let stopper = stop.clone();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, stopper).await {
            std::process::exit(130);
        }
    });

    // Sensor work blocks (data-ready polling, calibration), so it gets its own thread.
    let output = tokio::task::spawn_blocking(move || -> Result<OutputPipeline> {
        let bus = I2cdev::new(&config.device_path)
            .with_context(|| format!("Failed to open i2c device {}", config.device_path))?;
        let device = Mag3110::new(bus).context("Failed to initialize magnetometer")?;

        let mut session = SensorSession::new(device);
        session.initialize().context("Failed to reset magnetometer")?;
        if config.run_calibration {
            session.calibrate().context("Calibration failed")?;
        }
        session.start().context("Failed to start magnetometer")?;
        log::info!("sensor {}", session.state());

        let offsets = session
            .reported_offsets()
            .context("Failed to read offset registers")?;
        output.record_provenance(config.run_calibration, offsets);

        println!("Start mag loop");
        println!("Output: {} Suffix:{}", data_log.display(), config.output_suffix);

        AcquisitionLoop::new(session, &output, config.verbose)
            .with_stop_flag(stop)
            .run()
            .context("Magnetometer read failed")?;
        Ok(output)
    })
    .await
    .context("Acquisition thread panicked")??;

    let report = output.shutdown().await;
    log::info!(
        "data log closed: {} records written, {} failed",
        report.records_written,
        report.write_failures
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_cli_overrides_from_flags() {
        let matches = cli()
            .try_get_matches_from([
                "rpimag", "-d", "/dev/i2c-1", "-f", "site.yaml", "-o", "_a", "-X", r"C:\logs", "-v", "-c",
            ])
            .unwrap();
        let cli = overrides(&matches);
        assert_eq!(cli.device.as_deref(), Some("/dev/i2c-1"));
        assert_eq!(cli.settings_file, Some(PathBuf::from("site.yaml")));
        assert_eq!(cli.outsuffix.as_deref(), Some("_a"));
        assert_eq!(cli.output_dir.as_deref(), Some(r"C:\logs"));
        assert!(cli.verbose);
        assert!(cli.calibration);
    }

    #[test]
    fn test_cli_long_flags_and_absent_values() {
        let matches = cli()
            .try_get_matches_from(["rpimag", "--device", "/dev/i2c-2", "--output_dir", "out"])
            .unwrap();
        let cli = overrides(&matches);
        assert_eq!(cli.device.as_deref(), Some("/dev/i2c-2"));
        assert_eq!(cli.output_dir.as_deref(), Some("out"));
        assert_eq!(cli.settings_file, None);
        assert_eq!(cli.outsuffix, None);
        assert!(!cli.verbose);
        assert!(!cli.calibration);
    }

    #[test]
    fn test_cli_help_and_errors() {
        let err = cli().try_get_matches_from(["rpimag", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);

        let err = cli().try_get_matches_from(["rpimag", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_ne!(err.exit_code(), 0);
        assert!(err.render().to_string().contains("--help"));

        for flag in ["-V", "--version", "-h"] {
            let err = cli().try_get_matches_from(["rpimag", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnknownArgument, "{flag}");
        }
    }

    #[tokio::test]
    async fn test_first_interrupt_stops_second_exits() {
        let stop = Arc::new(AtomicBool::new(false));
        let forced = watch_interrupts(|| std::future::ready(Ok(())), stop.clone()).await;
        assert!(forced);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_single_interrupt_only_stops() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut calls = 0;
        let forced = watch_interrupts(
            || {
                calls += 1;
                std::future::ready(if calls == 1 {
                    Ok(())
                } else {
                    Err(io::Error::other("signal stream closed"))
                })
            },
            stop.clone(),
        )
        .await;
        assert!(!forced);
        assert!(stop.load(Ordering::Relaxed));

        let stop = Arc::new(AtomicBool::new(false));
        let forced = watch_interrupts(
            || std::future::ready(Err(io::Error::other("no signal handler"))),
            stop.clone(),
        )
        .await;
        assert!(!forced);
        assert!(!stop.load(Ordering::Relaxed));
    }
}
