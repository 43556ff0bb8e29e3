use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use sketchforge_core::{CommandResult, ExpectOutcome, LineBuffer, ToolError, ToolResult};
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub mod parse;

pub use parse::{parse_compile, parse_diagnostic_line, undeclared_identifier};

const EXIT_POLL: Duration = Duration::from_millis(10);
const KILL_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        let mut text = self.program.clone();
        for arg in &self.args {
            text.push(' ');
            if arg.contains(' ') {
                text.push('"');
                text.push_str(arg);
                text.push('"');
            } else {
                text.push_str(arg);
            }
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// When set, every chunk is forwarded here as it arrives.
    pub stream: Option<Sender<OutputChunk>>,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(u64);

#[derive(Debug)]
pub enum ProcessEvent {
    Output(OutputChunk),
    Exited(Option<i32>),
}

enum PipeEvent {
    Data(StreamKind, Vec<u8>),
    Closed(StreamKind),
}

type LiveProcesses = Arc<Mutex<HashMap<ProcessHandle, Arc<Mutex<Child>>>>>;

/// Spawns and supervises external commands. Owns the table of live children
/// so that `kill` can reach a process from any thread.
#[derive(Default)]
pub struct ProcessRunner {
    live: LiveProcesses,
    next_id: AtomicU64,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, command: &ToolCommand, options: &RunOptions) -> ToolResult<SpawnedProcess> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        debug!("spawn: {}", command.display());
        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0;
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, StreamKind::Stdout, tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, StreamKind::Stderr, tx);
            open_streams += 1;
        }

        let handle = ProcessHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        let child = Arc::new(Mutex::new(child));
        lock(&self.live).insert(handle, child.clone());

        Ok(SpawnedProcess {
            handle,
            command: command.display(),
            child,
            live: self.live.clone(),
            events: rx,
            open_streams,
            exit: None,
        })
    }

    /// Runs to completion, buffering all output. A timeout kills the child and
    /// returns [`ToolError::Timeout`] with the partial result attached.
    pub fn run(&self, command: &ToolCommand, options: RunOptions) -> ToolResult<CommandResult> {
        let started = Instant::now();
        let mut process = self.spawn(command, &options)?;
        let deadline = options.timeout.map(|timeout| started + timeout);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let exit_code = loop {
            let wait = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(3600),
            };
            match process.next_event(wait) {
                Some(ProcessEvent::Output(chunk)) => {
                    match chunk.stream {
                        StreamKind::Stdout => stdout.extend_from_slice(&chunk.data),
                        StreamKind::Stderr => stderr.extend_from_slice(&chunk.data),
                    }
                    if let Some(tx) = &options.stream {
                        let _ = tx.send(chunk);
                    }
                }
                Some(ProcessEvent::Exited(code)) => break code,
                None => {
                    if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                        process.kill();
                        for chunk in process.drain(KILL_DRAIN) {
                            match chunk.stream {
                                StreamKind::Stdout => stdout.extend_from_slice(&chunk.data),
                                StreamKind::Stderr => stderr.extend_from_slice(&chunk.data),
                            }
                        }
                        let after = options.timeout.unwrap_or_default();
                        warn!("{} timed out after {}ms", command.display(), after.as_millis());
                        let partial = CommandResult {
                            command: command.display(),
                            exit_code: None,
                            stdout: String::from_utf8_lossy(&stdout).to_string(),
                            stderr: String::from_utf8_lossy(&stderr).to_string(),
                            duration_ms: started.elapsed().as_millis(),
                            diagnostics: None,
                            memory: None,
                        };
                        return Err(ToolError::Timeout {
                            operation: command.display(),
                            after,
                            partial: Some(Box::new(partial)),
                        });
                    }
                }
            }
        };

        debug!("exit {:?}: {}", exit_code, command.display());
        Ok(CommandResult {
            command: command.display(),
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration_ms: started.elapsed().as_millis(),
            diagnostics: None,
            memory: None,
        })
    }

    /// Waits for the first output line matching `pattern`, or for `timeout`.
    /// The process is killed either way.
    pub fn expect(
        &self,
        command: &ToolCommand,
        pattern: &Regex,
        timeout: Duration,
    ) -> ToolResult<ExpectOutcome> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut process = self.spawn(command, &RunOptions::default())?;
        let mut stdout_lines = LineBuffer::new();
        let mut stderr_lines = LineBuffer::new();
        let mut logs = Vec::new();
        let mut capture = None;

        'watch: loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match process.next_event(remaining) {
                Some(ProcessEvent::Output(chunk)) => {
                    let buffer = match chunk.stream {
                        StreamKind::Stdout => &mut stdout_lines,
                        StreamKind::Stderr => &mut stderr_lines,
                    };
                    for line in buffer.push(&chunk.data) {
                        let found = match_line(pattern, &line);
                        logs.push(line);
                        if found.is_some() {
                            capture = found;
                            break 'watch;
                        }
                    }
                }
                Some(ProcessEvent::Exited(_)) => {
                    for line in [stdout_lines.finish(), stderr_lines.finish()].into_iter().flatten() {
                        let found = match_line(pattern, &line);
                        logs.push(line);
                        if found.is_some() {
                            capture = found;
                            break 'watch;
                        }
                    }
                    break;
                }
                None => {}
            }
        }

        process.kill();
        Ok(ExpectOutcome {
            matched: capture.is_some(),
            capture,
            logs,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Idempotent: `false` once the process has exited or was already killed.
    pub fn kill(&self, handle: ProcessHandle) -> bool {
        let child = lock(&self.live).get(&handle).cloned();
        match child {
            Some(child) => {
                let killed = kill_child(&child);
                lock(&self.live).remove(&handle);
                killed
            }
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

/// A running child whose output is pulled as [`ProcessEvent`]s. Dropping it
/// before exit kills the child.
pub struct SpawnedProcess {
    handle: ProcessHandle,
    command: String,
    child: Arc<Mutex<Child>>,
    live: LiveProcesses,
    events: Receiver<PipeEvent>,
    open_streams: u8,
    exit: Option<Option<i32>>,
}

impl SpawnedProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_finished(&self) -> bool {
        self.exit.is_some()
    }

    /// Returns the next event, or `None` if nothing happened within `wait`.
    /// `Exited` is yielded once, after both pipes have closed.
    pub fn next_event(&mut self, wait: Duration) -> Option<ProcessEvent> {
        if self.exit.is_some() {
            return None;
        }
        let deadline = Instant::now() + wait;
        while self.open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(PipeEvent::Data(stream, data)) => {
                    return Some(ProcessEvent::Output(OutputChunk { stream, data }))
                }
                Ok(PipeEvent::Closed(_)) => self.open_streams -= 1,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => self.open_streams = 0,
            }
        }

        loop {
            let status = lock(&self.child).try_wait();
            match status {
                Ok(Some(status)) => {
                    let code = status.code();
                    self.exit = Some(code);
                    lock(&self.live).remove(&self.handle);
                    return Some(ProcessEvent::Exited(code));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("wait failed for {}: {}", self.command, err);
                    self.exit = Some(None);
                    lock(&self.live).remove(&self.handle);
                    return Some(ProcessEvent::Exited(None));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL);
        }
    }

    pub fn kill(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        let killed = kill_child(&self.child);
        lock(&self.live).remove(&self.handle);
        killed
    }

    /// Collects output still in flight after a kill, bounded by `wait`.
    fn drain(&mut self, wait: Duration) -> Vec<OutputChunk> {
        let deadline = Instant::now() + wait;
        let mut chunks = Vec::new();
        while self.open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(PipeEvent::Data(stream, data)) => chunks.push(OutputChunk { stream, data }),
                Ok(PipeEvent::Closed(_)) => self.open_streams -= 1,
                Err(_) => break,
            }
        }
        chunks
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.kill();
        }
    }
}

fn kill_child(child: &Arc<Mutex<Child>>) -> bool {
    let mut child = lock(child);
    match child.try_wait() {
        Ok(Some(_)) => false,
        Ok(None) => {
            let killed = child.kill().is_ok();
            // reap so the status is cached for any later try_wait
            let _ = child.wait();
            killed
        }
        Err(_) => false,
    }
}

fn match_line(pattern: &Regex, line: &str) -> Option<String> {
    let caps = pattern.captures(line)?;
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().to_string())
}

fn pump<R: Read + Send + 'static>(mut reader: R, stream: StreamKind, tx: Sender<PipeEvent>) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(PipeEvent::Data(stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(PipeEvent::Closed(stream));
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn buffers_stdout_and_stderr() {
        let runner = ProcessRunner::new();
        let result = runner
            .run(&sh("echo out; echo err 1>&2; exit 3"), RunOptions::default())
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.success());
        assert_eq!(runner.live_count(), 0);
    }

    #[test]
    fn streams_chunks_while_buffering() {
        let runner = ProcessRunner::new();
        let (tx, rx) = mpsc::channel();
        let options = RunOptions {
            stream: Some(tx),
            ..RunOptions::default()
        };
        let result = runner.run(&sh("echo one; echo two"), options).unwrap();
        let streamed: String = rx.try_iter().map(|chunk| chunk.text()).collect();
        assert_eq!(streamed, result.stdout);
        assert!(result.success());
    }

    #[test]
    fn passes_env_and_cwd() {
        let runner = ProcessRunner::new();
        let options = RunOptions {
            cwd: Some(std::env::temp_dir()),
            env: vec![("SKETCHFORGE_TEST".to_string(), "42".to_string())],
            ..RunOptions::default()
        };
        let result = runner.run(&sh("echo $SKETCHFORGE_TEST"), options).unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }

    #[test]
    fn timeout_kills_and_keeps_partial_output() {
        let runner = ProcessRunner::new();
        let err = runner
            .run(
                &sh("echo started; sleep 5"),
                RunOptions::with_timeout(Duration::from_millis(300)),
            )
            .unwrap_err();
        assert!(err.is_timeout());
        let partial = err.partial_output().expect("partial output");
        assert_eq!(partial.stdout, "started\n");
        assert_eq!(partial.exit_code, None);
        assert_eq!(runner.live_count(), 0);
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let runner = ProcessRunner::new();
        let err = runner
            .run(&ToolCommand::new("definitely-not-a-real-tool-xyz"), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn expect_captures_group_and_kills() {
        let runner = ProcessRunner::new();
        let pattern = Regex::new(r"IP: (\d+\.\d+\.\d+\.\d+)").unwrap();
        let outcome = runner
            .expect(
                &sh("echo booting; echo 'IP: 10.0.0.7'; sleep 5"),
                &pattern,
                Duration::from_secs(3),
            )
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.capture.as_deref(), Some("10.0.0.7"));
        assert_eq!(outcome.logs, vec!["booting".to_string(), "IP: 10.0.0.7".to_string()]);
        assert!(outcome.elapsed_ms < 3000);
        assert_eq!(runner.live_count(), 0);
    }

    #[test]
    fn expect_times_out_without_match() {
        let runner = ProcessRunner::new();
        let pattern = Regex::new("never").unwrap();
        let outcome = runner
            .expect(&sh("echo tick; sleep 5"), &pattern, Duration::from_millis(300))
            .unwrap();
        assert!(!outcome.matched);
        assert!(outcome.capture.is_none());
        assert_eq!(outcome.logs, vec!["tick".to_string()]);
        assert_eq!(runner.live_count(), 0);
    }

    #[test]
    fn expect_matches_unterminated_last_line() {
        let runner = ProcessRunner::new();
        let pattern = Regex::new("done").unwrap();
        let outcome = runner
            .expect(&sh("printf done"), &pattern, Duration::from_secs(3))
            .unwrap();
        assert!(outcome.matched);
        assert_eq!(outcome.capture.as_deref(), Some("done"));
    }

    #[test]
    fn kill_is_idempotent() {
        let runner = ProcessRunner::new();
        let process = runner.spawn(&sh("sleep 5"), &RunOptions::default()).unwrap();
        let handle = process.handle();
        assert!(runner.kill(handle));
        assert!(!runner.kill(handle));
        assert!(!runner.kill(handle));
        drop(process);
    }

    #[test]
    fn kill_after_exit_returns_false() {
        let runner = ProcessRunner::new();
        let mut process = runner.spawn(&sh("true"), &RunOptions::default()).unwrap();
        let handle = process.handle();
        loop {
            if let Some(ProcessEvent::Exited(code)) = process.next_event(Duration::from_secs(2)) {
                assert_eq!(code, Some(0));
                break;
            }
        }
        assert!(!runner.kill(handle));
        assert!(!process.kill());
    }
}
