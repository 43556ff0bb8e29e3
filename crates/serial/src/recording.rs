//! Session recording. Entries are queued in memory and written by a separate
//! flusher thread, so recording never delays live event delivery.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sketchforge_core::now_utc_rfc3339;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    Raw,
    Csv,
    Json,
}

impl RecordingFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "raw" | "txt" => Some(Self::Raw),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub format: RecordingFormat,
    pub include_timestamp: bool,
    pub output_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub direction: Direction,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub output_file: PathBuf,
    pub entries: usize,
}

type Pending = Arc<Mutex<Vec<RecordEntry>>>;

pub struct Recorder {
    config: RecordingConfig,
    pending: Pending,
    failed: Arc<AtomicBool>,
    warned: AtomicBool,
    stop: Option<Sender<()>>,
    flusher: Option<JoinHandle<Result<usize>>>,
}

impl Recorder {
    /// Truncates the output file and starts the flusher thread.
    pub fn start(config: RecordingConfig, interval: Duration) -> Result<Self> {
        let file = File::create(&config.output_file)
            .with_context(|| format!("create recording {}", config.output_file.display()))?;
        let mut sink = RecordSink::new(BufWriter::new(file), config.format);
        sink.begin()?;

        let pending: Pending = Arc::new(Mutex::new(Vec::new()));
        let queue = pending.clone();
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = failed.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let path = config.output_file.clone();
        let flusher = thread::spawn(move || -> Result<usize> {
            let mut error: Option<anyhow::Error> = None;
            loop {
                let stopping = !matches!(stop_rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout));
                // Keeps draining after a write error so the queue stays bounded.
                let batch = std::mem::take(&mut *lock(&queue));
                if !batch.is_empty() && error.is_none() {
                    debug!("flushing {} record(s) to {}", batch.len(), path.display());
                    if let Err(err) = sink.write_batch(&batch) {
                        warn!("recording {} failed: {:#}", path.display(), err);
                        failed_flag.store(true, Ordering::SeqCst);
                        error = Some(err.context(format!("write recording {}", path.display())));
                    }
                }
                if stopping {
                    return match error {
                        Some(err) => Err(err),
                        None => sink.finish(),
                    };
                }
            }
        });

        Ok(Self {
            config,
            pending,
            failed,
            warned: AtomicBool::new(false),
            stop: Some(stop_tx),
            flusher: Some(flusher),
        })
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// True once a write to the output file has failed.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Entries recorded after a write failure are dropped.
    pub fn record(&self, direction: Direction, data: &str) {
        if self.failed() {
            if !self.warned.swap(true, Ordering::SeqCst) {
                warn!(
                    "recording {} has failed; dropping further entries",
                    self.config.output_file.display()
                );
            }
            return;
        }
        let timestamp = self.config.include_timestamp.then(now_utc_rfc3339);
        lock(&self.pending).push(RecordEntry {
            timestamp,
            direction,
            data: data.to_string(),
        });
    }

    /// Final flush, then closes the file.
    pub fn stop(mut self) -> Result<RecordingSummary> {
        let entries = self.shutdown()?;
        Ok(RecordingSummary {
            output_file: self.config.output_file.clone(),
            entries,
        })
    }

    fn shutdown(&mut self) -> Result<usize> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.flusher.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("recording flusher panicked"))?,
            None => Ok(0),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("recording {} ended with error: {:#}", self.config.output_file.display(), err);
        }
    }
}

struct RecordSink<W: Write> {
    out: W,
    format: RecordingFormat,
    written: usize,
}

impl<W: Write> RecordSink<W> {
    fn new(out: W, format: RecordingFormat) -> Self {
        Self {
            out,
            format,
            written: 0,
        }
    }

    fn begin(&mut self) -> Result<()> {
        match self.format {
            RecordingFormat::Raw => {}
            RecordingFormat::Csv => writeln!(self.out, "timestamp,direction,data")?,
            RecordingFormat::Json => write!(self.out, "[")?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn write_batch(&mut self, batch: &[RecordEntry]) -> Result<()> {
        for entry in batch {
            match self.format {
                RecordingFormat::Raw => self.out.write_all(raw_line(entry).as_bytes())?,
                RecordingFormat::Csv => writeln!(
                    self.out,
                    "{},{},{}",
                    entry.timestamp.as_deref().unwrap_or(""),
                    direction_label(entry.direction),
                    csv_quote(&entry.data)
                )?,
                RecordingFormat::Json => {
                    if self.written > 0 {
                        write!(self.out, ",")?;
                    }
                    write!(self.out, "\n  {}", serde_json::to_string(entry)?)?;
                }
            }
            self.written += 1;
        }
        self.out.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<usize> {
        if self.format == RecordingFormat::Json {
            if self.written > 0 {
                writeln!(self.out)?;
            }
            writeln!(self.out, "]")?;
        }
        self.out.flush()?;
        Ok(self.written)
    }
}

/// Outbound data is written verbatim; inbound entries are complete lines.
fn raw_line(entry: &RecordEntry) -> String {
    let mut data = entry.data.clone();
    if entry.direction == Direction::Inbound {
        data.push('\n');
    }
    match &entry.timestamp {
        None => data,
        Some(ts) => {
            if !data.ends_with('\n') {
                data.push('\n');
            }
            format!("[{}] {} {}", ts, direction_arrow(entry.direction), data)
        }
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Inbound => "inbound",
        Direction::Outbound => "outbound",
    }
}

fn direction_arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Inbound => "<",
        Direction::Outbound => ">",
    }
}

fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
