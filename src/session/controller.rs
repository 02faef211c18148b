//! Session controller: connect, ingest, reconnect, shut down

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::{SessionHandle, SessionObserver, SessionReport, SessionState};
use crate::config::Config;
use crate::error::{LoggerError, Result};
use crate::sensor::decoder::decode_frame;
use crate::sensor::encoder::encode_values;
use crate::sensor::framer::{FrameEvent, FrameReader};
use crate::sensor::protocol::{CaptureTime, ParameterTable, Reading};
use crate::sensor::validator::{validate, StrictnessMode};
use crate::serial::{PortResolver, PortSelection};
use crate::stats::StatsAggregator;
use crate::telemetry::{LogWriter, StatsLog, WriterOptions};

/// Readings buffered per subscriber before it starts lagging
const READING_FEED_CAPACITY: usize = 256;

/// Typed session parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub selection: PortSelection,
    pub read_timeout: Duration,
    pub max_frame_len: usize,
    pub reconnect_interval: Duration,
    pub reconnect_max: Duration,
    pub max_consecutive_malformed: u32,
    pub window_size: usize,
    pub strictness: StrictnessMode,
    pub echo_raw: bool,
    pub save_statistics: bool,
    pub stats_interval_readings: u64,
    pub max_write_failures: u32,
    pub writer: WriterOptions,
}

impl SessionSettings {
    /// Settings from a validated configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            selection: config.port_selection(),
            read_timeout: config.read_timeout(),
            max_frame_len: config.serial.max_frame_len,
            reconnect_interval: Duration::from_millis(config.serial.reconnect_interval_ms),
            reconnect_max: Duration::from_millis(config.serial.reconnect_max_ms),
            max_consecutive_malformed: config.stats.max_consecutive_malformed,
            window_size: config.window_size(),
            strictness: config.stats.strictness,
            echo_raw: config.logging.echo_raw,
            save_statistics: config.logging.save_statistics,
            stats_interval_readings: config.logging.stats_interval_readings,
            max_write_failures: config.logging.max_write_failures,
            writer: WriterOptions {
                dir: config.logging.log_dir.clone(),
                prefix: config.logging.prefix.clone(),
                formats: config.logging.formats.clone(),
                max_file_size: config.max_file_size(),
                rotate_interval: config.rotate_interval(),
                log_invalid: config.logging.log_invalid,
            },
        }
    }
}

/// Why a streaming period ended
enum StreamEnd {
    Shutdown,
    /// Recoverable: go through Reconnecting
    Lost(String),
    Fatal(LoggerError),
}

enum StreamEvent {
    Stop,
    Dump,
    Frame(Result<String>),
}

/// Runs the ingestion pipeline
pub struct SessionController {
    settings: SessionSettings,
    table: ParameterTable,
    resolver: PortResolver,
    aggregator: StatsAggregator,
    writer: LogWriter,
    stats_log: Option<StatsLog>,
    observers: Vec<Box<dyn SessionObserver>>,
    readings: broadcast::Sender<Arc<Reading>>,
    state: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    dump: Arc<Notify>,
    write_failures: u32,
    recorded: u64,
}

impl SessionController {
    /// Create a session and open its log files
    ///
    /// # Arguments
    ///
    /// * `settings` - Session parameters
    /// * `table` - Plausibility table for validation and formatting
    /// * `resolver` - Port resolver used on every (re)connect
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the log directory or files cannot be
    /// created. This is the only fatal startup failure; device problems are
    /// handled by reconnecting.
    pub fn new(
        settings: SessionSettings,
        table: ParameterTable,
        resolver: PortResolver,
    ) -> Result<Self> {
        let writer = LogWriter::open(settings.writer.clone(), table.clone())?;
        let stats_log = if settings.save_statistics {
            Some(StatsLog::open(&settings.writer.dir, &settings.writer.prefix)?)
        } else {
            None
        };

        for path in writer.active_paths() {
            info!("Data log: {}", path.display());
        }
        if let Some(log) = &stats_log {
            info!("Stats log: {}", log.path().display());
        }

        let (readings, _) = broadcast::channel(READING_FEED_CAPACITY);
        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Ok(Self {
            aggregator: StatsAggregator::new(settings.window_size, settings.strictness),
            settings,
            table,
            resolver,
            writer,
            stats_log,
            observers: Vec::new(),
            readings,
            state,
            state_rx,
            shutdown: Arc::new(shutdown),
            shutdown_rx,
            dump: Arc::new(Notify::new()),
            write_failures: 0,
            recorded: 0,
        })
    }

    /// Session over the system's serial ports, configured from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut resolver = PortResolver::system(config.serial.platform, config.serial.baud_rate);
        if let Some(timeout) = config.probe_timeout() {
            resolver = resolver.with_probe(timeout, config.serial.max_frame_len);
        }
        Self::new(SessionSettings::from_config(config), config.parameter_table()?, resolver)
    }

    /// Register an observer; must happen before [`run`](Self::run)
    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Consumer handle
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            stats: self.aggregator.handle(),
            readings: self.readings.clone(),
            state: self.state_rx.clone(),
            shutdown: Arc::clone(&self.shutdown),
            dump: Arc::clone(&self.dump),
        }
    }

    /// Run until shutdown is requested or logging fails persistently
    ///
    /// # Returns
    ///
    /// * `Result<SessionReport>` - Counts and files of the finished session
    ///
    /// # Errors
    ///
    /// Returns `LogWrite` after `max_write_failures` consecutive failed
    /// writes. The logs are flushed and the final statistics written first.
    pub async fn run(mut self) -> Result<SessionReport> {
        let mut backoff =
            Backoff::new(self.settings.reconnect_interval, self.settings.reconnect_max);
        let mut fatal = None;

        info!("Session starting (port: {:?})", self.settings.selection);

        'session: loop {
            self.set_state(SessionState::Connecting);

            let resolved = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown_rx) => break 'session,
                resolved = self.resolver.resolve(&self.settings.selection) => resolved,
            };

            match resolved {
                Ok(resolved) => {
                    self.set_state(SessionState::Streaming);
                    backoff.reset();

                    let mut reader = FrameReader::new(
                        resolved.port,
                        self.settings.max_frame_len,
                        self.settings.read_timeout,
                    );
                    let end = self.stream(&mut reader).await;
                    let stranded = reader.drain();
                    self.count_stranded(stranded);
                    reader.reset();

                    match end {
                        StreamEnd::Shutdown => break 'session,
                        StreamEnd::Fatal(e) => {
                            error!("Logging failed: {}", e);
                            fatal = Some(e);
                            break 'session;
                        }
                        StreamEnd::Lost(reason) => warn!("Lost {}: {}", resolved.path, reason),
                    }
                }
                Err(e) if !e.is_recoverable() => {
                    error!("Cannot connect: {}", e);
                    fatal = Some(e);
                    break 'session;
                }
                Err(e) => warn!("Connect failed: {}", e),
            }

            self.set_state(SessionState::Reconnecting);
            let delay = backoff.next_delay();
            info!("Reconnecting in {:?}", delay);

            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut self.shutdown_rx) => break 'session,
                    _ = self.dump.notified() => self.dump_stats(),
                    _ = sleep_until(deadline) => break,
                }
            }

            self.aggregator.count(|c| c.reconnects += 1);
        }

        let report = self.finish();
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn stream(&mut self, reader: &mut FrameReader) -> StreamEnd {
        let mut malformed_run = 0u32;

        loop {
            let event = tokio::select! {
                biased;
                _ = stop_requested(&mut self.shutdown_rx) => StreamEvent::Stop,
                _ = self.dump.notified() => StreamEvent::Dump,
                frame = reader.next_frame() => StreamEvent::Frame(frame),
            };

            let frame = match event {
                StreamEvent::Stop => return self.ingest_pending(reader, &mut malformed_run),
                StreamEvent::Dump => {
                    self.dump_stats();
                    continue;
                }
                StreamEvent::Frame(Ok(frame)) => frame,
                StreamEvent::Frame(Err(LoggerError::FrameOverflow { discarded })) => {
                    warn!("Frame overflow, discarded {} bytes", discarded);
                    self.aggregator.count(|c| c.overflows += 1);
                    continue;
                }
                StreamEvent::Frame(Err(LoggerError::ReadTimeout(after))) => {
                    self.aggregator.count(|c| c.timeouts += 1);
                    return StreamEnd::Lost(format!("no data for {:?}", after));
                }
                StreamEvent::Frame(Err(e)) => return StreamEnd::Lost(e.to_string()),
            };

            if let Some(end) = self.handle_frame(&frame, &mut malformed_run) {
                return end;
            }
        }
    }

    /// Decode, validate and ingest one frame
    fn handle_frame(&mut self, frame: &str, malformed_run: &mut u32) -> Option<StreamEnd> {
        self.aggregator.count(|c| c.frames += 1);

        match decode_frame(frame, CaptureTime::now()) {
            Ok(sample) => {
                *malformed_run = 0;
                let reading = validate(sample, &self.table);
                if let Err(e) = self.ingest(reading) {
                    return Some(StreamEnd::Fatal(e));
                }
            }
            Err(e) => {
                if self.settings.echo_raw {
                    info!(target: "raw_frame", "{} | malformed", frame);
                }
                debug!("Dropped frame: {}", e);
                self.aggregator.count(|c| c.malformed += 1);

                *malformed_run += 1;
                if *malformed_run >= self.settings.max_consecutive_malformed {
                    let reason = format!("{} consecutive malformed frames", malformed_run);
                    return Some(StreamEnd::Lost(reason));
                }
            }
        }
        None
    }

    /// Ingest the frames the reader already holds, then end for shutdown
    fn ingest_pending(&mut self, reader: &mut FrameReader, malformed_run: &mut u32) -> StreamEnd {
        let mut pending = reader.drain().into_iter();

        while let Some(event) = pending.next() {
            match event {
                FrameEvent::Frame(frame) => {
                    if let Some(StreamEnd::Fatal(e)) = self.handle_frame(&frame, malformed_run) {
                        self.count_stranded(pending.collect());
                        return StreamEnd::Fatal(e);
                    }
                }
                FrameEvent::Overflow { discarded } => {
                    warn!("Frame overflow, discarded {} bytes", discarded);
                    self.aggregator.count(|c| c.overflows += 1);
                }
            }
        }

        StreamEnd::Shutdown
    }

    /// Count frames received but never ingested as lost readings
    fn count_stranded(&mut self, events: Vec<FrameEvent>) {
        if events.is_empty() {
            return;
        }
        let frames = events
            .iter()
            .filter(|e| matches!(e, FrameEvent::Frame(_)))
            .count() as u64;
        let overflows = events.len() as u64 - frames;

        warn!("Dropping {} received frames with the connection", frames);
        self.aggregator.count(|c| {
            c.frames += frames;
            c.lost += frames;
            c.overflows += overflows;
        });
    }

    /// Aggregate, log and publish one reading
    fn ingest(&mut self, reading: Reading) -> Result<()> {
        if self.settings.echo_raw {
            let encoded = encode_values(&self.table, reading.values());
            info!(target: "raw_frame", "{} | {}", reading.raw(), encoded);
        }
        if !reading.is_valid() {
            debug!("Out of range: {:?} in '{}'", reading.validity(), reading.raw());
        }

        let admitted = self.aggregator.record(&reading);

        match self.writer.write(&reading) {
            Ok(_) => self.write_failures = 0,
            Err(e) => {
                self.write_failures += 1;
                self.aggregator.count(|c| c.lost += 1);
                warn!("Reading lost ({} consecutive failures): {}", self.write_failures, e);
                if self.write_failures >= self.settings.max_write_failures {
                    return Err(e);
                }
            }
        }

        for observer in &mut self.observers {
            observer.on_reading(&reading);
        }
        // No subscribers is not an error
        let _ = self.readings.send(Arc::new(reading));

        if admitted {
            self.recorded += 1;
            let interval = self.settings.stats_interval_readings;
            if interval > 0 && self.recorded % interval == 0 {
                self.dump_stats();
            }
        }

        Ok(())
    }

    fn dump_stats(&mut self) {
        let snapshot = self.aggregator.publish();

        if let Some(log) = &mut self.stats_log {
            if let Err(e) = log.write_snapshot(&snapshot) {
                warn!("Statistics dump failed: {}", e);
            }
        }

        let counters = snapshot.counters;
        info!(
            "Stats: {} frames, {} valid, {} invalid, {} malformed, {} reconnects",
            counters.frames,
            counters.valid,
            counters.invalid,
            counters.malformed,
            counters.reconnects
        );

        for observer in &mut self.observers {
            observer.on_stats(&snapshot);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Session {} -> {}", previous, state);
        }
        for observer in &mut self.observers {
            observer.on_state(state);
        }
    }

    fn finish(mut self) -> SessionReport {
        self.set_state(SessionState::ShuttingDown);

        self.dump_stats();
        let final_snapshot = self.aggregator.publish();
        let stats_file = self.stats_log.as_ref().map(|log| log.path().to_path_buf());
        let files: Vec<PathBuf> = self.writer.files().to_vec();
        let readings_logged = self.writer.written();

        if let Err(e) = self.writer.close() {
            warn!("Closing data logs failed: {}", e);
        }

        // Serial port was released when the reader went out of scope
        self.state.send_replace(SessionState::Stopped);
        for observer in &mut self.observers {
            observer.on_state(SessionState::Stopped);
        }
        info!("Session stopped");

        SessionReport {
            readings_lost: final_snapshot.counters.lost,
            reconnects: final_snapshot.counters.reconnects,
            final_snapshot,
            readings_logged,
            files,
            stats_file,
        }
    }
}

/// Resolves once shutdown is requested
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::sensor::protocol::ParamCode;
    use crate::serial::port_trait::mocks::MockSerialPort;
    use crate::serial::{MockDeviceLister, MockPortOpener, PlatformFilter};
    use crate::telemetry::LogFormat;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PORT: &str = "/dev/ttyUSB0";

    /// Observer recording every state it is told about
    struct StateRecorder(Arc<Mutex<Vec<SessionState>>>);

    impl SessionObserver for StateRecorder {
        fn on_state(&mut self, state: SessionState) {
            self.0.lock().unwrap().push(state);
        }
    }

    fn settings(dir: &TempDir) -> SessionSettings {
        SessionSettings {
            selection: PortSelection::Path(PORT.to_string()),
            read_timeout: Duration::from_secs(5),
            max_frame_len: 512,
            reconnect_interval: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_consecutive_malformed: 20,
            window_size: 100,
            strictness: StrictnessMode::Exclude,
            echo_raw: false,
            save_statistics: true,
            stats_interval_readings: 200,
            max_write_failures: 5,
            writer: WriterOptions {
                dir: dir.path().join("OUTPUT"),
                prefix: "Trisonica".to_string(),
                formats: vec![LogFormat::Tagged],
                max_file_size: 10 * 1024 * 1024,
                rotate_interval: None,
                log_invalid: true,
            },
        }
    }

    /// Resolver whose opener hands out `ports` in order, then fails
    fn resolver(ports: Vec<MockSerialPort>) -> PortResolver {
        let queue = Arc::new(Mutex::new(VecDeque::from(ports)));
        let mut opener = MockPortOpener::new();
        opener.expect_open().returning(move |path, _| {
            match queue.lock().unwrap().pop_front() {
                Some(port) => Ok(Box::new(port)),
                None => Err(LoggerError::DeviceOpen {
                    path: path.to_string(),
                    reason: "No such file or directory".to_string(),
                }),
            }
        });

        PortResolver::new(
            Box::new(MockDeviceLister::new()),
            Box::new(opener),
            Box::new(PlatformFilter::new(Platform::Linux)),
            115_200,
        )
    }

    fn session(cfg: SessionSettings, ports: Vec<MockSerialPort>) -> SessionController {
        SessionController::new(cfg, ParameterTable::builtin(), resolver(ports)).unwrap()
    }

    fn data_frames(files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .flat_map(|p| {
                std::fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .map(|l| l.rsplit('\t').next().unwrap().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_reconnects_without_partial_reading() {
        let dir = tempfile::tempdir().unwrap();

        let first = MockSerialPort::with_lines(&["S=3.2 D=185.0 T=21.4 H=55.0", "S=3.3 D=186.0"]);
        first.push_data(b"S=3.4 D=1");
        first.push_eof();
        let second = MockSerialPort::with_lines(&["S=3.5 D=187.0"]);

        let states = Arc::new(Mutex::new(Vec::new()));
        let mut controller = session(settings(&dir), vec![first, second]);
        controller.add_observer(Box::new(StateRecorder(Arc::clone(&states))));

        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(feed.recv().await.unwrap().raw().to_string());
        }
        assert_eq!(received, vec!["S=3.2 D=185.0 T=21.4 H=55.0", "S=3.3 D=186.0", "S=3.5 D=187.0"]);

        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        let states = states.lock().unwrap().clone();
        let streaming = states.iter().position(|s| *s == SessionState::Streaming).unwrap();
        assert_eq!(
            &states[streaming..streaming + 4],
            &[
                SessionState::Streaming,
                SessionState::Reconnecting,
                SessionState::Connecting,
                SessionState::Streaming
            ]
        );
        assert_eq!(states.last(), Some(&SessionState::Stopped));
        assert_eq!(handle.state(), SessionState::Stopped);

        assert_eq!(report.reconnects, 1);
        assert_eq!(report.readings_logged, 3);
        assert_eq!(report.readings_lost, 0);
        assert_eq!(
            data_frames(&report.files),
            vec!["S=3.2 D=185.0 T=21.4 H=55.0", "S=3.3 D=186.0", "S=3.5 D=187.0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_malformed_frames_force_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(&dir);
        cfg.max_consecutive_malformed = 3;

        let first = MockSerialPort::with_lines(&["S=1", "NOPE", "S=abc", "D=NaN", "S=2"]);
        let second = MockSerialPort::with_lines(&["S=4"]);

        let controller = session(cfg, vec![first, second]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        let values: Vec<f64> = vec![
            feed.recv().await.unwrap().get(ParamCode::S).unwrap(),
            feed.recv().await.unwrap().get(ParamCode::S).unwrap(),
        ];
        // "S=2" is never read: the port was dropped after the third malformed frame
        assert_eq!(values, vec![1.0, 4.0]);

        handle.shutdown();
        let report = task.await.unwrap().unwrap();
        let counters = report.final_snapshot.counters;
        assert_eq!(counters.malformed, 3);
        assert_eq!(counters.frames, 5);
        assert_eq!(counters.reconnects, 1);
    }

    /// Observer that requests shutdown as soon as a reading arrives
    struct StopOnReading(SessionHandle);

    impl SessionObserver for StopOnReading {
        fn on_reading(&mut self, _reading: &Reading) {
            self.0.shutdown();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ingests_frames_already_received() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockSerialPort::new();
        port.push_data(b"S=1\nS=2\nS=3\n");

        let mut controller = session(settings(&dir), vec![port]);
        let handle = controller.handle();
        controller.add_observer(Box::new(StopOnReading(handle.clone())));

        let report = controller.run().await.unwrap();

        let counters = report.final_snapshot.counters;
        assert_eq!(counters.frames, 3);
        assert_eq!(report.readings_logged, 3);
        assert_eq!(report.readings_lost, 0);
        assert_eq!(data_frames(&report.files), vec!["S=1", "S=2", "S=3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_stranded_by_reconnect_are_counted_lost() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(&dir);
        cfg.max_consecutive_malformed = 2;

        let first = MockSerialPort::new();
        first.push_data(b"NOPE\nBAD\nS=7\nS=8\n");
        let second = MockSerialPort::with_lines(&["S=9"]);

        let controller = session(cfg, vec![first, second]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        assert_eq!(feed.recv().await.unwrap().get(ParamCode::S), Some(9.0));
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        let counters = report.final_snapshot.counters;
        assert_eq!(counters.frames, 5);
        assert_eq!(counters.malformed, 2);
        assert_eq!(counters.lost, 2);
        let accounted = counters.valid + counters.invalid + counters.malformed + counters.lost;
        assert_eq!(counters.frames, accounted);
        assert_eq!(report.readings_logged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_write_failure_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(&dir);
        cfg.save_statistics = false;
        cfg.max_write_failures = 3;
        // Every write after the first needs a rotation
        cfg.writer.max_file_size = 1;
        let log_dir = cfg.writer.dir.clone();

        let port = MockSerialPort::with_lines(&["S=1", "S=2", "S=3", "S=4", "S=5", "S=6"]);
        let controller = session(cfg, vec![port]);
        let handle = controller.handle();
        std::fs::remove_dir_all(&log_dir).unwrap();

        let result = controller.run().await;
        assert!(matches!(result, Err(LoggerError::LogWrite(_))));

        let counters = handle.snapshot().counters;
        assert_eq!(counters.lost, 3);
        assert_eq!(counters.frames, 4);
        assert_eq!(handle.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_count_resets_between_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(&dir);
        cfg.save_statistics = false;
        cfg.max_write_failures = 2;
        cfg.writer.max_file_size = 1;
        cfg.writer.log_invalid = false;
        let log_dir = cfg.writer.dir.clone();

        // Invalid readings are skipped by the writer, so they never fail
        let port = MockSerialPort::with_lines(&["S=1", "S=2", "S=999", "S=3", "S=999", "S=4"]);
        let controller = session(cfg, vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        std::fs::remove_dir_all(&log_dir).unwrap();
        let task = tokio::spawn(controller.run());

        for _ in 0..6 {
            feed.recv().await.unwrap();
        }
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.readings_lost, 3);
        assert_eq!(report.readings_logged, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_malformed_frames_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockSerialPort::with_lines(&["S=1", "garbage", "S=2", "S=inf", "S=3"]);

        let controller = session(settings(&dir), vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        for _ in 0..3 {
            feed.recv().await.unwrap();
        }
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.reconnects, 0);
        assert_eq!(report.final_snapshot.counters.malformed, 2);
        assert_eq!(report.final_snapshot.get(ParamCode::S).unwrap().cumulative.count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_and_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let first = MockSerialPort::with_lines(&["S=1"]);
        let second = MockSerialPort::with_lines(&["S=2"]);

        let controller = session(settings(&dir), vec![first, second]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        feed.recv().await.unwrap();
        feed.recv().await.unwrap();
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.final_snapshot.counters.timeouts, 1);
        assert_eq!(report.reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_reading_logged_but_not_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockSerialPort::with_lines(&["S=3.2 D=185.0 T=21.4 H=55.0", "S=999.0 D=185.0"]);

        let controller = session(settings(&dir), vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        assert!(feed.recv().await.unwrap().is_valid());
        assert!(!feed.recv().await.unwrap().is_valid());
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        let snapshot = &report.final_snapshot;
        assert_eq!(snapshot.get(ParamCode::S).unwrap().cumulative.count, 1);
        assert_eq!(snapshot.get(ParamCode::D).unwrap().cumulative.count, 1);
        assert_eq!(snapshot.counters.invalid, 1);
        assert_eq!(report.readings_logged, 2);

        let raw = std::fs::read_to_string(&report.files[0]).unwrap();
        assert!(raw.contains("\tINVALID\tS=999.0 D=185.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_dump_and_shutdown_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = settings(&dir);
        cfg.stats_interval_readings = 2;
        let port = MockSerialPort::with_lines(&["S=1", "S=2", "S=3", "S=4", "S=5"]);

        let controller = session(cfg, vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        for _ in 0..5 {
            feed.recv().await.unwrap();
        }
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        let stats = std::fs::read_to_string(report.stats_file.unwrap()).unwrap();
        // Two periodic dumps and the final one
        assert_eq!(stats.lines().filter(|l| l.contains(",_frames,")).count(), 3);
        assert!(stats.lines().any(|l| l.contains(",S,") && l.contains(",5,")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_trigger_writes_stats() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockSerialPort::with_lines(&["S=1"]);

        let controller = session(settings(&dir), vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let mut state = handle.watch_state();
        let task = tokio::spawn(controller.run());

        feed.recv().await.unwrap();
        state.wait_for(|s| *s == SessionState::Streaming).await.unwrap();
        let before = handle.snapshot();
        handle.dump_stats();
        // A dump republishes the snapshot
        while Arc::ptr_eq(&before, &handle.snapshot()) {
            tokio::task::yield_now().await;
        }
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        let stats = std::fs::read_to_string(report.stats_file.unwrap()).unwrap();
        assert_eq!(stats.lines().filter(|l| l.contains(",_frames,")).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let controller = session(settings(&dir), vec![]);
        let handle = controller.handle();
        let mut state = handle.watch_state();
        let task = tokio::spawn(controller.run());

        state.wait_for(|s| *s == SessionState::Reconnecting).await.unwrap();
        handle.shutdown();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.readings_logged, 0);
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(handle.snapshot().parameters.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_available_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockSerialPort::with_lines(&["S=2", "S=4"]);

        let controller = session(settings(&dir), vec![port]);
        let handle = controller.handle();
        let mut feed = handle.subscribe();
        let task = tokio::spawn(controller.run());

        feed.recv().await.unwrap();
        feed.recv().await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.get(ParamCode::S).unwrap().cumulative.mean, 3.0);
        assert_eq!(snapshot.get(ParamCode::S).unwrap().window.std_dev, Some(1.0));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_unwritable_log_dir_fails_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let mut cfg = settings(&dir);
        cfg.writer.dir = blocker.join("OUTPUT");
        let result = SessionController::new(cfg, ParameterTable::builtin(), resolver(vec![]));
        assert!(matches!(result, Err(LoggerError::InvalidConfig(_))));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.serial.platform = Platform::Windows;
        config.serial.port = "COM7".to_string();

        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.selection, PortSelection::Path("COM7".to_string()));
        assert_eq!(settings.window_size, 200);
        assert_eq!(settings.writer.max_file_size, 100 * 1024 * 1024);
        assert_eq!(settings.reconnect_interval, Duration::from_secs(1));
    }
}
