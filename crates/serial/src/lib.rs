use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sketchforge_core::{ExpectOutcome, LineBuffer, ToolConfig};
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub mod recording;
pub mod sensor;

pub use recording::{Direction, Recorder, RecordingConfig, RecordingFormat, RecordingSummary};
pub use sensor::{parse_sensor_data, SensorReading};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::with_baud(115_200)
    }
}

impl SerialConfig {
    pub fn with_baud(baud: u32) -> Self {
        Self {
            baud,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenStatus {
    pub port: String,
    pub config: SerialConfig,
    pub already_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SerialEvent {
    Data { port: String, line: String },
    Disconnected { port: String, reason: String },
    Reconnected { port: String, attempt: u32 },
    Closed { port: String },
}

/// How the reader thread behaves after the link drops.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

pub struct SerialLink {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

pub trait PortConnector: Send + Sync {
    fn connect(&self, port: &str, config: &SerialConfig) -> Result<SerialLink>;
}

pub struct SystemConnector;

impl PortConnector for SystemConnector {
    fn connect(&self, port: &str, config: &SerialConfig) -> Result<SerialLink> {
        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => bail!("unsupported data bits: {}", other),
        };
        let stop_bits = match config.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => bail!("unsupported stop bits: {}", other),
        };
        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };

        let reader = serialport::new(port, config.baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("open {} @ {}", port, config.baud))?;
        let writer = reader
            .try_clone()
            .with_context(|| format!("clone handle for {}", port))?;
        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

/// State shared between a session's owner and its reader thread.
struct SessionShared {
    port: String,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    filters: Mutex<Vec<Regex>>,
    subscribers: Mutex<Vec<Sender<SerialEvent>>>,
    taps: Mutex<HashMap<u64, Sender<String>>>,
    recorder: Mutex<Option<Recorder>>,
    next_tap: AtomicU64,
    stopping: AtomicBool,
    closed: AtomicBool,
}

impl SessionShared {
    fn new(port: &str, writer: Box<dyn Write + Send>) -> Self {
        Self {
            port: port.to_string(),
            writer: Mutex::new(Some(writer)),
            filters: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            taps: Mutex::new(HashMap::new()),
            recorder: Mutex::new(None),
            next_tap: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn publish(&self, event: SerialEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Recording and taps see every line; subscribers only see lines that pass
    /// the filters.
    fn inbound(&self, line: String) {
        if let Some(recorder) = lock(&self.recorder).as_ref() {
            recorder.record(Direction::Inbound, &line);
        }
        lock(&self.taps).retain(|_, tx| tx.send(line.clone()).is_ok());

        let forward = {
            let filters = lock(&self.filters);
            filters.is_empty() || filters.iter().any(|re| re.is_match(&line))
        };
        if forward {
            self.publish(SerialEvent::Data {
                port: self.port.clone(),
                line,
            });
        }
    }

    fn close_once(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.publish(SerialEvent::Closed {
                port: self.port.clone(),
            });
        }
    }

    fn add_tap(&self) -> (u64, Receiver<String>) {
        let id = self.next_tap.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        lock(&self.taps).insert(id, tx);
        (id, rx)
    }

    fn remove_tap(&self, id: u64) {
        lock(&self.taps).remove(&id);
    }
}

struct Session {
    config: SerialConfig,
    shared: Arc<SessionShared>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    fn shutdown(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(recorder) = lock(&self.shared.recorder).take() {
            if let Err(err) = recorder.stop() {
                warn!("final recording flush on {} failed: {:#}", self.shared.port, err);
            }
        }
        *lock(&self.shared.writer) = None;
        self.shared.close_once();
    }
}

/// Owns every open serial session, keyed by port path. At most one session
/// exists per port.
pub struct SerialSessionManager {
    connector: Arc<dyn PortConnector>,
    sessions: Mutex<HashMap<String, Session>>,
    opening: Mutex<HashSet<String>>,
    flush_interval: Duration,
    reconnect: ReconnectPolicy,
}

impl SerialSessionManager {
    pub fn new(config: &ToolConfig) -> Self {
        Self::with_connector(Arc::new(SystemConnector), config.flush_interval())
    }

    pub fn with_connector(connector: Arc<dyn PortConnector>, flush_interval: Duration) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
            flush_interval,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn set_reconnect_policy(&mut self, policy: ReconnectPolicy) {
        self.reconnect = policy;
    }

    /// Opening a port that already has a session returns that session's
    /// status without touching the hardware.
    pub fn open(&self, port: &str, config: SerialConfig) -> Result<OpenStatus> {
        let stale = {
            let mut sessions = lock(&self.sessions);
            if let Some(existing) = sessions.get(port) {
                if !existing.shared.closed.load(Ordering::SeqCst) {
                    return Ok(OpenStatus {
                        port: port.to_string(),
                        config: existing.config,
                        already_open: true,
                    });
                }
            }
            if !lock(&self.opening).insert(port.to_string()) {
                bail!("{} is already being opened", port);
            }
            sessions.remove(port)
        };
        // The hardware is opened without holding the session table.
        if let Some(mut stale) = stale {
            stale.shutdown();
        }
        let link = self.connector.connect(port, &config);

        let mut sessions = lock(&self.sessions);
        lock(&self.opening).remove(port);
        let link = link?;
        let shared = Arc::new(SessionShared::new(port, link.writer));
        let reader = spawn_reader(
            link.reader,
            shared.clone(),
            self.connector.clone(),
            config,
            self.reconnect,
        );
        info!("serial session opened: {} @ {}", port, config.baud);
        sessions.insert(
            port.to_string(),
            Session {
                config,
                shared,
                reader: Some(reader),
            },
        );
        Ok(OpenStatus {
            port: port.to_string(),
            config,
            already_open: false,
        })
    }

    /// Returns `false` when no session was open on `port`.
    pub fn close(&self, port: &str) -> bool {
        let session = lock(&self.sessions).remove(port);
        match session {
            Some(mut session) => {
                session.shutdown();
                info!("serial session closed: {}", port);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, port: &str) -> bool {
        lock(&self.sessions)
            .get(port)
            .map(|session| !session.shared.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ports.sort();
        ports
    }

    pub fn subscribe(&self, port: &str) -> Result<Receiver<SerialEvent>> {
        let shared = self.shared(port)?;
        let (tx, rx) = mpsc::channel();
        lock(&shared.subscribers).push(tx);
        Ok(rx)
    }

    /// Holds the port's writer lock for the whole write, so concurrent
    /// writers never interleave.
    pub fn write(&self, port: &str, data: &str, add_newline: bool) -> Result<usize> {
        let shared = self.shared(port)?;
        let mut payload = data.to_string();
        if add_newline {
            payload.push('\n');
        }

        let mut writer = lock(&shared.writer);
        let out = writer
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not connected", port))?;
        out.write_all(payload.as_bytes())
            .with_context(|| format!("write to {}", port))?;
        out.flush().with_context(|| format!("flush {}", port))?;
        if let Some(recorder) = lock(&shared.recorder).as_ref() {
            recorder.record(Direction::Outbound, &payload);
        }
        debug!("wrote {} byte(s) to {}", payload.len(), port);
        Ok(payload.len())
    }

    /// Waits for the first inbound line matching `pattern`. Filters do not
    /// apply here.
    pub fn expect(&self, port: &str, pattern: &Regex, timeout: Duration) -> Result<ExpectOutcome> {
        let shared = self.shared(port)?;
        let started = Instant::now();
        let deadline = started + timeout;
        let (id, lines) = shared.add_tap();
        let _tap = TapGuard {
            shared: shared.clone(),
            id,
        };

        let mut logs = Vec::new();
        let mut capture = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match lines.recv_timeout(remaining) {
                Ok(line) => {
                    let found = capture_of(pattern, &line);
                    logs.push(line);
                    if found.is_some() {
                        capture = found;
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(ExpectOutcome {
            matched: capture.is_some(),
            capture,
            logs,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Replaces the port's filters. An empty list forwards every line.
    pub fn set_filters(&self, port: &str, patterns: &[String]) -> Result<()> {
        let shared = self.shared(port)?;
        let compiled = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid filter '{}'", pattern))
            })
            .collect::<Result<Vec<_>>>()?;
        *lock(&shared.filters) = compiled;
        Ok(())
    }

    /// Starts a fresh recording. A recording already running on the port is
    /// finished first.
    pub fn start_recording(&self, port: &str, config: RecordingConfig) -> Result<()> {
        let shared = self.shared(port)?;
        let previous = lock(&shared.recorder).take();
        if let Some(previous) = previous {
            if previous.failed() {
                if let Err(err) = previous.stop() {
                    warn!("replacing failed recording on {}: {:#}", port, err);
                }
            } else {
                previous.stop()?;
            }
        }
        let recorder = Recorder::start(config, self.flush_interval)?;
        info!(
            "recording {} to {} ({:?})",
            port,
            recorder.config().output_file.display(),
            recorder.config().format
        );
        *lock(&shared.recorder) = Some(recorder);
        Ok(())
    }

    /// `Some(true)` when the port's recording can no longer write its file.
    pub fn recording_failed(&self, port: &str) -> Result<Option<bool>> {
        let shared = self.shared(port)?;
        let failed = lock(&shared.recorder).as_ref().map(Recorder::failed);
        Ok(failed)
    }

    pub fn stop_recording(&self, port: &str) -> Result<RecordingSummary> {
        let shared = self.shared(port)?;
        let recorder = lock(&shared.recorder)
            .take()
            .ok_or_else(|| anyhow!("{} is not recording", port))?;
        recorder.stop()
    }

    fn shared(&self, port: &str) -> Result<Arc<SessionShared>> {
        lock(&self.sessions)
            .get(port)
            .map(|session| session.shared.clone())
            .ok_or_else(|| anyhow!("no open session on {}", port))
    }
}

impl Drop for SerialSessionManager {
    fn drop(&mut self) {
        let sessions: Vec<Session> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for mut session in sessions {
            session.shutdown();
        }
    }
}

struct TapGuard {
    shared: Arc<SessionShared>,
    id: u64,
}

impl Drop for TapGuard {
    fn drop(&mut self) {
        self.shared.remove_tap(self.id);
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    shared: Arc<SessionShared>,
    connector: Arc<dyn PortConnector>,
    config: SerialConfig,
    policy: ReconnectPolicy,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 1024];
        loop {
            if shared.stopping.load(Ordering::SeqCst) {
                return;
            }
            let failure = match reader.read(&mut buf) {
                Ok(0) => "end of stream".to_string(),
                Ok(n) => {
                    for line in lines.push(&buf[..n]) {
                        shared.inbound(line);
                    }
                    continue;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => err.to_string(),
            };

            if shared.stopping.load(Ordering::SeqCst) {
                return;
            }
            if let Some(tail) = lines.finish() {
                shared.inbound(tail);
            }
            warn!("serial link {} lost: {}", shared.port, failure);
            *lock(&shared.writer) = None;
            shared.publish(SerialEvent::Disconnected {
                port: shared.port.clone(),
                reason: failure,
            });

            match reconnect(&shared, connector.as_ref(), &config, policy) {
                Some((link, attempt)) => {
                    reader = link.reader;
                    *lock(&shared.writer) = Some(link.writer);
                    info!("serial link {} restored after {} attempt(s)", shared.port, attempt);
                    shared.publish(SerialEvent::Reconnected {
                        port: shared.port.clone(),
                        attempt,
                    });
                }
                None => {
                    if !shared.stopping.load(Ordering::SeqCst) {
                        warn!("giving up on {}", shared.port);
                        shared.close_once();
                    }
                    return;
                }
            }
        }
    })
}

fn reconnect(
    shared: &SessionShared,
    connector: &dyn PortConnector,
    config: &SerialConfig,
    policy: ReconnectPolicy,
) -> Option<(SerialLink, u32)> {
    for attempt in 1..=policy.attempts {
        if !sleep_unless_stopping(shared, policy.delay) {
            return None;
        }
        match connector.connect(&shared.port, config) {
            Ok(link) => return Some((link, attempt)),
            Err(err) => debug!("reconnect {} attempt {} failed: {:#}", shared.port, attempt, err),
        }
    }
    None
}

fn sleep_unless_stopping(shared: &SessionShared, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(STOP_POLL));
    }
}

fn capture_of(pattern: &Regex, line: &str) -> Option<String> {
    pattern.captures(line).map(|caps| {
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
