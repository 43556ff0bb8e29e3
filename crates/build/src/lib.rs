use log::{debug, info, warn};
use serde::Serialize;
use sketchforge_core::{
    CommandResult, CompileReport, DevicePort, LineBuffer, ToolConfig, ToolError, ToolResult,
};
use sketchforge_device::{BoardProbe, ProbedBoard};
use sketchforge_process::{
    parse_compile, ProcessEvent, ProcessRunner, RunOptions, SpawnedProcess, ToolCommand,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod listing;

pub use listing::{parse_board_list, parse_lib_list, BoardMatch, DetectedBoard, InstalledLibrary};

/// Probed in this order after a successful compile.
pub const BINARY_EXTENSIONS: [&str; 4] = ["hex", "bin", "uf2", "elf"];

const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct CompileOutcome {
    pub success: bool,
    pub result: CommandResult,
    pub report: CompileReport,
    pub binary: Option<PathBuf>,
    pub build_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadOptions {
    /// Passed as `upload.speed`; `None` keeps the board default.
    pub baud: Option<u32>,
    pub input_dir: Option<PathBuf>,
    pub verify: bool,
}

/// The build surface recovery drives. Implemented by [`BuildOrchestrator`]
/// and by test doubles.
pub trait Toolchain {
    fn compile(&self, sketch: &Path, fqbn: &str, extra_args: &[String]) -> ToolResult<CompileOutcome>;
    fn upload(
        &self,
        sketch: &Path,
        fqbn: &str,
        port: &str,
        options: &UploadOptions,
    ) -> ToolResult<CommandResult>;
    fn lib_install(&self, name: &str) -> ToolResult<CommandResult>;
    fn lib_uninstall(&self, name: &str) -> ToolResult<CommandResult>;
    fn lib_list(&self) -> ToolResult<Vec<InstalledLibrary>>;
}

pub struct BuildOrchestrator {
    runner: Arc<ProcessRunner>,
    config: ToolConfig,
}

impl BuildOrchestrator {
    pub fn new(runner: Arc<ProcessRunner>, config: ToolConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(self.config.cli_path.clone())
    }

    /// `<build_root>/<sketch>-<fqbn>` with `:` flattened so it is a valid
    /// directory name everywhere.
    pub fn build_dir(&self, sketch: &Path, fqbn: &str) -> PathBuf {
        let board = fqbn.replace([':', '=', ','], "_");
        self.config
            .build_root
            .join(format!("{}-{}", sketch_name(sketch), board))
    }

    pub fn compile(
        &self,
        sketch: &Path,
        fqbn: &str,
        extra_args: &[String],
    ) -> ToolResult<CompileOutcome> {
        let build_dir = self.build_dir(sketch, fqbn);
        std::fs::create_dir_all(&build_dir)?;

        let command = self
            .command()
            .args(["compile", "--fqbn", fqbn, "--build-path"])
            .arg(build_dir.display().to_string())
            .arg("--verbose")
            .args(extra_args.iter().cloned())
            .arg(sketch.display().to_string());
        info!("compiling {} for {}", sketch.display(), fqbn);
        let mut result = self
            .runner
            .run(&command, RunOptions::with_timeout(self.config.compile_timeout()))?;

        let report = parse_compile(&result.combined_output());
        result.diagnostics = Some(report.diagnostics.clone());
        result.memory = report.memory.clone();
        let success = result.success() && report.success;

        let binary = if success {
            find_binary(&build_dir, &sketch_name(sketch))
        } else {
            None
        };
        match (&binary, success) {
            (Some(path), _) => info!("compile ok: {}", path.display()),
            (None, true) => warn!("compile ok but no binary found in {}", build_dir.display()),
            (None, false) => info!(
                "compile failed: {} error(s)",
                report.errors().count()
            ),
        }

        Ok(CompileOutcome {
            success,
            result,
            report,
            binary,
            build_dir,
        })
    }

    /// Output is returned as-is; upload failures are classified by the
    /// recovery engine, not parsed as compiler diagnostics.
    pub fn upload(
        &self,
        sketch: &Path,
        fqbn: &str,
        port: &str,
        options: &UploadOptions,
    ) -> ToolResult<CommandResult> {
        let mut command = self
            .command()
            .args(["upload", "-p", port, "--fqbn", fqbn]);
        let input_dir = options.input_dir.clone().or_else(|| {
            let dir = self.build_dir(sketch, fqbn);
            dir.is_dir().then_some(dir)
        });
        if let Some(dir) = input_dir {
            command = command.arg("--input-dir").arg(dir.display().to_string());
        }
        if options.verify {
            command = command.arg("--verify");
        }
        if let Some(baud) = options.baud {
            command = command
                .arg("--upload-property")
                .arg(format!("upload.speed={}", baud));
        }
        command = command.arg(sketch.display().to_string());

        info!("uploading {} to {} ({})", sketch.display(), port, fqbn);
        let result = self
            .runner
            .run(&command, RunOptions::with_timeout(self.config.upload_timeout()))?;
        if !result.success() {
            debug!("upload stderr: {}", result.stderr.trim());
        }
        Ok(result)
    }

    pub fn monitor(&self, port: &str, baud: u32, fqbn: Option<&str>) -> ToolResult<MonitorStream> {
        let mut command = self
            .command()
            .args(["monitor", "-p", port, "--config"])
            .arg(format!("baudrate={}", baud));
        if let Some(fqbn) = fqbn {
            command = command.args(["--fqbn", fqbn]);
        }
        let process = self.runner.spawn(&command, &RunOptions::default())?;
        info!("monitor started on {} @ {}", port, baud);
        Ok(MonitorStream {
            process,
            lines: LineBuffer::new(),
            queued: VecDeque::new(),
            exit: None,
        })
    }

    pub fn board_list(&self) -> ToolResult<Vec<DetectedBoard>> {
        let result = self.passthrough(&["board", "list", "--format", "json"])?;
        parse_board_list(&checked(result)?.stdout)
    }

    pub fn board_search(&self, query: &str) -> ToolResult<CommandResult> {
        self.passthrough(&["board", "search", query])
    }

    pub fn core_install(&self, core: &str) -> ToolResult<CommandResult> {
        self.passthrough(&["core", "install", core])
    }

    pub fn core_list(&self) -> ToolResult<CommandResult> {
        self.passthrough(&["core", "list"])
    }

    pub fn lib_search(&self, query: &str) -> ToolResult<CommandResult> {
        self.passthrough(&["lib", "search", query])
    }

    pub fn lib_install(&self, name: &str) -> ToolResult<CommandResult> {
        self.passthrough(&["lib", "install", name])
    }

    pub fn lib_uninstall(&self, name: &str) -> ToolResult<CommandResult> {
        self.passthrough(&["lib", "uninstall", name])
    }

    pub fn lib_list(&self) -> ToolResult<Vec<InstalledLibrary>> {
        let result = self.passthrough(&["lib", "list", "--format", "json"])?;
        parse_lib_list(&checked(result)?.stdout)
    }

    fn passthrough(&self, args: &[&str]) -> ToolResult<CommandResult> {
        let command = self.command().args(args.iter().copied());
        let result = self
            .runner
            .run(&command, RunOptions::with_timeout(PASSTHROUGH_TIMEOUT))?;
        debug!("{} -> {:?}", result.command, result.exit_code);
        Ok(result)
    }
}

impl Toolchain for BuildOrchestrator {
    fn compile(&self, sketch: &Path, fqbn: &str, extra_args: &[String]) -> ToolResult<CompileOutcome> {
        BuildOrchestrator::compile(self, sketch, fqbn, extra_args)
    }

    fn upload(
        &self,
        sketch: &Path,
        fqbn: &str,
        port: &str,
        options: &UploadOptions,
    ) -> ToolResult<CommandResult> {
        BuildOrchestrator::upload(self, sketch, fqbn, port, options)
    }

    fn lib_install(&self, name: &str) -> ToolResult<CommandResult> {
        BuildOrchestrator::lib_install(self, name)
    }

    fn lib_uninstall(&self, name: &str) -> ToolResult<CommandResult> {
        BuildOrchestrator::lib_uninstall(self, name)
    }

    fn lib_list(&self) -> ToolResult<Vec<InstalledLibrary>> {
        BuildOrchestrator::lib_list(self)
    }
}

fn checked(result: CommandResult) -> ToolResult<CommandResult> {
    match result.error_text() {
        None => Ok(result),
        Some(message) => Err(ToolError::Command {
            command: result.command.clone(),
            message,
        }),
    }
}

/// Sketch folder name: `Blink/Blink.ino` and `Blink/` both give `Blink`.
pub fn sketch_name(sketch: &Path) -> String {
    let name = if sketch.extension().is_some() {
        sketch.file_stem()
    } else {
        sketch.file_name()
    };
    name.map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "sketch".to_string())
}

/// First `<name>.ino.<ext>` that exists, in [`BINARY_EXTENSIONS`] order.
pub fn find_binary(build_dir: &Path, name: &str) -> Option<PathBuf> {
    BINARY_EXTENSIONS
        .iter()
        .map(|ext| build_dir.join(format!("{}.ino.{}", name, ext)))
        .find(|path| path.is_file())
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Line(String),
    Ended(Option<i32>),
}

/// Live lines from the tool's `monitor` subcommand. Dropping it stops the
/// monitor process.
pub struct MonitorStream {
    process: SpawnedProcess,
    lines: LineBuffer,
    queued: VecDeque<String>,
    exit: Option<Option<i32>>,
}

impl MonitorStream {
    /// Next complete line, `Ended` once the tool has exited and every line
    /// was delivered, or `None` when nothing arrived within `wait`.
    pub fn next_event(&mut self, wait: Duration) -> Option<MonitorEvent> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(line) = self.queued.pop_front() {
                return Some(MonitorEvent::Line(line));
            }
            if let Some(code) = self.exit.take() {
                return Some(MonitorEvent::Ended(code));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.process.next_event(remaining)? {
                ProcessEvent::Output(chunk) => self.queued.extend(self.lines.push(&chunk.data)),
                ProcessEvent::Exited(code) => {
                    self.queued.extend(self.lines.finish());
                    self.exit = Some(code);
                }
            }
        }
    }

    pub fn stop(mut self) -> bool {
        self.process.kill()
    }
}

/// Device tool-probe stage backed by `board list --format json`.
pub struct CliBoardProbe {
    orchestrator: Arc<BuildOrchestrator>,
}

impl CliBoardProbe {
    pub fn new(orchestrator: Arc<BuildOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl BoardProbe for CliBoardProbe {
    fn probe(&self, port: &DevicePort) -> Option<ProbedBoard> {
        let detected = match self.orchestrator.board_list() {
            Ok(detected) => detected,
            Err(err) => {
                debug!("board list probe failed: {}", err);
                return None;
            }
        };
        detected
            .into_iter()
            .find(|entry| entry.port == port.path)?
            .boards
            .into_iter()
            .find(|board| !board.fqbn.is_empty())
            .map(|board| ProbedBoard {
                fqbn: board.fqbn,
                name: board.name,
            })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const FAKE_CLI: &str = r#"#!/bin/sh
here=$(dirname "$0")
all="$*"
echo "$all" >> "$here/calls.log"
cmd="$1 $2"
build=""
sketch=""
while [ $# -gt 0 ]; do
  case "$1" in
    --build-path) shift; build="$1" ;;
    *) sketch="$1" ;;
  esac
  shift
done
case "$cmd" in
  compile*)
    case "$sketch" in
      *Broken*)
        echo "$sketch/Broken.ino:10:5: error: 'foo' was not declared in this scope" >&2
        exit 1 ;;
    esac
    echo "Sketch uses 2018 bytes (6%) of program storage space. Maximum is 32256 bytes."
    echo "Global variables use 188 bytes (9%) of dynamic memory, leaving 1860 bytes for local variables. Maximum is 2048 bytes."
    touch "$build/Blink.ino.bin" "$build/Blink.ino.elf"
    exit 0 ;;
  upload*)
    case "$all" in
      *busy*) echo "avrdude: ser_open(): can't open device: Device or resource busy" >&2; exit 1 ;;
    esac
    echo "done uploading"
    exit 0 ;;
  "board list")
    echo '{"detected_ports": [{"port": {"address": "/dev/ttyACM0", "protocol": "serial"}, "matching_boards": [{"name": "Arduino Uno", "fqbn": "arduino:avr:uno"}]}]}' ;;
  "lib list")
    echo '[{"library": {"name": "Servo", "version": "1.2.1"}}]' ;;
  "lib install")
    echo "error: library not found" >&2; exit 1 ;;
  monitor*)
    printf 'hello\nworld'
    exit 0 ;;
  *) echo "ok" ;;
esac
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        orchestrator: BuildOrchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cli = dir.path().join("fake-cli");
            std::fs::write(&cli, FAKE_CLI).unwrap();
            std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();
            let config = ToolConfig {
                cli_path: cli.display().to_string(),
                build_root: dir.path().join("build"),
                ..ToolConfig::default()
            };
            let orchestrator = BuildOrchestrator::new(Arc::new(ProcessRunner::new()), config);
            Self { dir, orchestrator }
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn compile_parses_memory_and_finds_first_binary() {
        let fx = Fixture::new();
        let sketch = fx.dir.path().join("Blink");
        let outcome = fx.orchestrator.compile(&sketch, "arduino:avr:uno", &[]).unwrap();

        assert!(outcome.success);
        let memory = outcome.report.memory.clone().unwrap();
        assert_eq!(memory.flash_bytes, 2018);
        assert_eq!(memory.flash_pct, 6);
        assert_eq!(outcome.result.memory, Some(memory));
        assert_eq!(
            outcome.binary,
            Some(outcome.build_dir.join("Blink.ino.bin"))
        );
        assert!(outcome.build_dir.ends_with("Blink-arduino_avr_uno"));

        let calls = fx.calls();
        assert!(calls[0].starts_with("compile --fqbn arduino:avr:uno --build-path "));
        assert!(calls[0].contains("--verbose"));
    }

    #[test]
    fn failed_compile_carries_diagnostics() {
        let fx = Fixture::new();
        let sketch = fx.dir.path().join("Broken");
        let outcome = fx.orchestrator.compile(&sketch, "arduino:avr:uno", &[]).unwrap();

        assert!(!outcome.success);
        assert!(outcome.binary.is_none());
        let diagnostics = outcome.result.diagnostics.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].line, 10);
        assert_eq!(diagnostics[0].code.as_str(), "E_UNDECLARED");
    }

    #[test]
    fn upload_passes_baud_and_input_dir() {
        let fx = Fixture::new();
        let sketch = fx.dir.path().join("Blink");
        fx.orchestrator.compile(&sketch, "arduino:avr:uno", &[]).unwrap();

        let options = UploadOptions {
            baud: Some(57_600),
            verify: true,
            ..UploadOptions::default()
        };
        let result = fx
            .orchestrator
            .upload(&sketch, "arduino:avr:uno", "/dev/ttyACM0", &options)
            .unwrap();
        assert!(result.success());
        assert!(result.diagnostics.is_none());

        let call = fx.calls().pop().unwrap();
        assert!(call.starts_with("upload -p /dev/ttyACM0 --fqbn arduino:avr:uno --input-dir "));
        assert!(call.contains("--verify --upload-property upload.speed=57600"));
    }

    #[test]
    fn failed_upload_is_a_result_not_an_error() {
        let fx = Fixture::new();
        let sketch = fx.dir.path().join("Blink");
        let result = fx
            .orchestrator
            .upload(&sketch, "arduino:avr:uno", "/dev/busy0", &UploadOptions::default())
            .unwrap();
        assert!(!result.success());
        assert!(result.error_text().unwrap().contains("resource busy"));
    }

    #[test]
    fn passthroughs_keep_tool_status() {
        let fx = Fixture::new();
        let boards = fx.orchestrator.board_list().unwrap();
        assert_eq!(boards[0].boards[0].name, "Arduino Uno");

        let libs = fx.orchestrator.lib_list().unwrap();
        assert_eq!(libs[0].name, "Servo");

        let install = fx.orchestrator.lib_install("Nope").unwrap();
        assert!(!install.success());
        assert!(fx.orchestrator.core_list().unwrap().success());
    }

    #[test]
    fn missing_tool_is_spawn_error() {
        let config = ToolConfig {
            cli_path: "/nonexistent/arduino-cli".to_string(),
            ..ToolConfig::default()
        };
        let orchestrator = BuildOrchestrator::new(Arc::new(ProcessRunner::new()), config);
        let err = orchestrator.board_list().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn cli_probe_matches_port_path() {
        let fx = Fixture::new();
        let probe = CliBoardProbe::new(Arc::new(fx.orchestrator));
        let found = probe.probe(&DevicePort::bare("/dev/ttyACM0")).unwrap();
        assert_eq!(found.fqbn, "arduino:avr:uno");
        assert!(probe.probe(&DevicePort::bare("/dev/ttyUSB4")).is_none());
    }

    #[test]
    fn monitor_streams_lines_then_ends() {
        let fx = Fixture::new();
        let mut stream = fx.orchestrator.monitor("/dev/ttyACM0", 9600, None).unwrap();
        let wait = Duration::from_secs(5);
        assert_eq!(stream.next_event(wait), Some(MonitorEvent::Line("hello".to_string())));
        assert_eq!(stream.next_event(wait), Some(MonitorEvent::Line("world".to_string())));
        assert_eq!(stream.next_event(wait), Some(MonitorEvent::Ended(Some(0))));
        assert_eq!(stream.next_event(Duration::from_millis(10)), None);
        assert!(fx.calls()[0].starts_with("monitor -p /dev/ttyACM0 --config baudrate=9600"));
    }

    #[test]
    fn sketch_names() {
        assert_eq!(sketch_name(Path::new("/src/Blink/Blink.ino")), "Blink");
        assert_eq!(sketch_name(Path::new("/src/Blink")), "Blink");
    }
}
