//! # TriSonica Logger
//!
//! Continuous data logger for TriSonica ultrasonic wind sensors.
//!
//! Reads the sensor's serial telemetry, validates every reading, keeps
//! rolling statistics and writes rotated CSV/JSON/raw logs until stopped.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use trisonica_logger::config::{Config, Platform};
use trisonica_logger::sensor::validator::StrictnessMode;
use trisonica_logger::session::{SessionController, SessionHandle, SessionReport};
use trisonica_logger::telemetry::LogFormat;

/// Command-line options; each one overrides the configuration file
#[derive(Parser, Debug)]
#[command(name = "trisonica-logger", version)]
#[command(about = "Serial data logger for TriSonica ultrasonic wind sensors")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port path, or "auto" to detect
    #[arg(short, long, env = "TRISONICA_PORT")]
    port: Option<String>,

    #[arg(short, long)]
    baud: Option<u32>,

    /// Output directory for data and statistics logs
    #[arg(long, env = "TRISONICA_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Data log format (csv, json, tagged); repeat for several
    #[arg(long = "format", value_name = "FORMAT")]
    formats: Vec<LogFormat>,

    /// Rotate data logs at this size in bytes
    #[arg(long)]
    max_file_size: Option<u64>,

    /// Rotate data logs after this many seconds (0 disables)
    #[arg(long)]
    rotate_interval_secs: Option<u64>,

    /// Rolling statistics window length
    #[arg(long)]
    window_size: Option<usize>,

    /// Invalid readings in statistics: exclude or flag
    #[arg(long)]
    strictness: Option<StrictnessMode>,

    /// Echo every received frame to the diagnostic log
    #[arg(long)]
    echo_raw: bool,

    /// Disable the statistics log
    #[arg(long)]
    no_stats: bool,

    /// Do not write invalid readings to the data logs
    #[arg(long)]
    no_invalid: bool,

    /// Platform profile (linux, mac, windows, pi)
    #[arg(long)]
    platform: Option<Platform>,

    /// Run unattended: diagnostics go to a daily log file
    #[arg(long)]
    daemon: bool,
}

impl Cli {
    /// Apply command-line overrides to `config`
    fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(platform) = self.platform {
            config.serial.platform = platform;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.log_dir = dir.clone();
        }
        if !self.formats.is_empty() {
            config.logging.formats = self.formats.clone();
        }
        if let Some(size) = self.max_file_size {
            config.logging.max_file_size_bytes = Some(size);
        }
        if let Some(secs) = self.rotate_interval_secs {
            config.logging.rotate_interval_s = secs;
        }
        if let Some(window) = self.window_size {
            config.stats.window_size = Some(window);
        }
        if let Some(strictness) = self.strictness {
            config.stats.strictness = strictness;
        }
        if self.echo_raw {
            config.logging.echo_raw = true;
        }
        if self.no_stats {
            config.logging.save_statistics = false;
        }
        if self.no_invalid {
            config.logging.log_invalid = false;
        }
    }

    /// Configuration file (or defaults) with overrides applied and validated
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::parse_file(path)
                .with_context(|| format!("Failed to read configuration {}", path.display()))?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Set up diagnostics: stderr, or a daily file in daemon mode
fn init_tracing(config: &Config, daemon: bool) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if daemon {
        std::fs::create_dir_all(&config.logging.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.logging.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(
            &config.logging.log_dir,
            format!("{}Logger.log", config.logging.prefix),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}

/// Map process signals onto the session: stop on Ctrl+C/SIGTERM, dump on SIGUSR1
async fn handle_signals(handle: SessionHandle) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut dump = signal(SignalKind::user_defined1())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = dump.recv() => {
                    info!("Received SIGUSR1, dumping statistics");
                    handle.dump_stats();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    handle.shutdown();
    Ok(())
}

fn log_summary(report: &SessionReport) {
    let counters = report.final_snapshot.counters;
    info!("Session summary:");
    info!("  Readings logged: {}", report.readings_logged);
    info!("  Readings lost: {}", report.readings_lost);
    info!(
        "  Frames: {} ({} valid, {} invalid, {} malformed, {} overflows)",
        counters.frames, counters.valid, counters.invalid, counters.malformed, counters.overflows
    );
    info!("  Timeouts: {}, reconnects: {}", counters.timeouts, report.reconnects);
    info!("  Parameters tracked: {}", report.final_snapshot.parameters.len());
    for path in &report.files {
        info!("  Data file: {}", path.display());
    }
    if let Some(path) = &report.stats_file {
        info!("  Statistics: {}", path.display());
    }
}

/// Main entry point for the TriSonica logger
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Parse the command line and load the configuration
///    - Set up diagnostics (stderr, or a daily file with `--daemon`)
///    - Open the data and statistics logs
///
/// 2. **Session**
///    - Connect to the sensor (explicit port or auto-detect)
///    - Log readings until stopped, reconnecting whenever the device goes away
///    - Dump statistics periodically and on SIGUSR1
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C or SIGTERM stops the session
///    - Logs are flushed and final statistics written
///    - A summary is logged
///
/// # Errors
///
/// Returns error if:
/// - The configuration is invalid
/// - The log directory cannot be written
/// - Data logging fails persistently
///
/// # Examples
///
/// ```bash
/// trisonica-logger --port auto --log-dir ./OUTPUT --format csv --format json
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    let _guard = init_tracing(&config, cli.daemon)?;

    info!("TriSonica Logger v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Platform: {}, port: {}, baud: {}",
        config.serial.platform, config.serial.port, config.serial.baud_rate
    );

    let controller =
        SessionController::from_config(&config).context("Failed to start logging session")?;
    let handle = controller.handle();

    tokio::spawn(async move {
        if let Err(e) = handle_signals(handle).await {
            warn!("Signal handling unavailable: {}", e);
        }
    });

    let report = controller.run().await.context("Logging session failed")?;
    log_summary(&report);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.serial.platform = Platform::Linux;
        config
    }

    #[test]
    fn test_cli_defaults_leave_config_untouched() {
        let cli = Cli::try_parse_from(["trisonica-logger"]).unwrap();
        let mut config = base_config();
        cli.apply(&mut config);

        // TRISONICA_PORT and TRISONICA_LOG_DIR may come from the environment
        let expected_port = std::env::var("TRISONICA_PORT").unwrap_or_else(|_| "auto".to_string());
        assert_eq!(config.serial.port, expected_port);
        assert_eq!(config.serial.baud_rate, base_config().serial.baud_rate);
        assert_eq!(config.logging.formats, vec![LogFormat::Csv]);
        assert!(config.logging.save_statistics);
        assert!(config.logging.log_invalid);
        assert!(!cli.daemon);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "trisonica-logger",
            "--port",
            "/dev/ttyUSB3",
            "--baud",
            "9600",
            "--log-dir",
            "/tmp/wind",
            "--format",
            "json",
            "--format",
            "tagged",
            "--max-file-size",
            "2048",
            "--rotate-interval-secs",
            "0",
            "--window-size",
            "50",
            "--strictness",
            "flag",
            "--echo-raw",
            "--no-stats",
            "--no-invalid",
            "--platform",
            "pi",
        ])
        .unwrap();

        let mut config = base_config();
        cli.apply(&mut config);

        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.platform, Platform::Pi);
        assert_eq!(config.logging.log_dir, PathBuf::from("/tmp/wind"));
        assert_eq!(config.logging.formats, vec![LogFormat::Json, LogFormat::Tagged]);
        assert_eq!(config.max_file_size(), 2048);
        assert_eq!(config.rotate_interval(), None);
        assert_eq!(config.window_size(), 50);
        assert_eq!(config.stats.strictness, StrictnessMode::Flag);
        assert!(config.logging.echo_raw);
        assert!(!config.logging.save_statistics);
        assert!(!config.logging.log_invalid);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["trisonica-logger", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_override_validated() {
        let cli = Cli::try_parse_from(["trisonica-logger", "--window-size", "0"]).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_load_config_file_then_override() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[serial]\nbaud_rate = 9600\nplatform = \"linux\"\n\n[logging]\nprefix = \"Mast\"\n"
        )
        .unwrap();
        file.flush().unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = ["trisonica-logger", "--config", &path, "--baud", "57600"];
        let cli = Cli::try_parse_from(args).unwrap();
        let config = cli.load_config().unwrap();

        assert_eq!(config.logging.prefix, "Mast");
        assert_eq!(config.serial.platform, Platform::Linux);
        assert_eq!(config.serial.baud_rate, 57_600);
    }
}
