//! Drives a sketch from source to a running board: compile, fix what can be
//! fixed automatically, upload with escalating recovery, then hand over to
//! the serial monitor. Every step is recorded as a state transition.

use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use sketchforge_build::{CompileOutcome, Toolchain, UploadOptions};
use sketchforge_core::{
    CommandResult, Diagnostic, ErrorCode, FixResult, IdentifiedDevice, ToolConfig,
};
use sketchforge_device::{fqbn_matches, DeviceControl};
use sketchforge_report::{create_run_report, ReportPaths};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub mod fixes;
pub mod flash;
pub mod retry;

pub use fixes::{
    candidate_patches, compare_versions, fix_include_paths, fix_library_collision,
    fix_syntax_patch, include_for, insert_include, IncludeFix, PatchEdit, SyntaxPatch,
    INCLUDE_TABLE,
};
pub use flash::{
    classify_upload_failure, flash_recovery, RecoveryOutcome, StageAttempt, UploadFailure,
    FALLBACK_BAUDS,
};
pub use retry::{retry_strategy, retry_with, Attempt, AttemptFailure, RetryOutcome, RetryPolicy};

const COLLISION_MARKER: &str = "Multiple libraries were found";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Compiling { attempt: u32 },
    CompileFailed { errors: usize },
    AutoFixing { attempt: u32 },
    CompileSucceeded,
    Uploading { attempt: u32, port: String },
    UploadFailed { reason: UploadFailure },
    FlashRecovering { port: String },
    UploadSucceeded { port: String },
    Monitoring { port: String },
    Failed {
        manual_intervention_required: bool,
        reason: String,
    },
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::Idle => write!(f, "idle"),
            RecoveryState::Compiling { attempt } => write!(f, "compiling (attempt {})", attempt),
            RecoveryState::CompileFailed { errors } => write!(f, "compile failed ({} error(s))", errors),
            RecoveryState::AutoFixing { attempt } => write!(f, "auto-fixing (round {})", attempt),
            RecoveryState::CompileSucceeded => write!(f, "compile succeeded"),
            RecoveryState::Uploading { attempt, port } => {
                write!(f, "uploading to {} (attempt {})", port, attempt)
            }
            RecoveryState::UploadFailed { reason } => write!(f, "upload failed ({:?})", reason),
            RecoveryState::FlashRecovering { port } => write!(f, "flash recovery on {}", port),
            RecoveryState::UploadSucceeded { port } => write!(f, "upload succeeded on {}", port),
            RecoveryState::Monitoring { port } => write!(f, "monitoring {}", port),
            RecoveryState::Failed { reason, .. } => write!(f, "failed: {}", reason),
        }
    }
}

/// Knobs the engine takes from `ToolConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RecoverySettings {
    pub max_fix_attempts: u32,
    pub max_upload_attempts: u32,
    pub patch_confidence_threshold: f32,
    pub retry_base_delay: Duration,
}

impl From<&ToolConfig> for RecoverySettings {
    fn from(config: &ToolConfig) -> Self {
        Self {
            max_fix_attempts: config.max_fix_attempts,
            max_upload_attempts: config.max_upload_attempts,
            patch_confidence_threshold: config.patch_confidence_threshold,
            retry_base_delay: config.retry_base_delay(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self::from(&ToolConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    /// Sketch directory or main `.ino` file.
    pub sketch: PathBuf,
    pub fqbn: String,
    /// Upload target; detected from connected boards when absent.
    pub port: Option<String>,
    pub extra_args: Vec<String>,
    pub upload: bool,
    pub monitor: bool,
    /// When set, a report bundle is written below this directory.
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    pub states: Vec<RecoveryState>,
    pub compile: Option<CompileOutcome>,
    pub fixes: FixResult,
    pub upload: Option<CommandResult>,
    pub flash_recovery: Option<RecoveryOutcome>,
    pub upload_failures: Vec<AttemptFailure>,
    pub port: Option<String>,
    pub device: Option<IdentifiedDevice>,
    pub safety_warnings: Vec<String>,
    pub logs: Vec<String>,
    pub report: Option<ReportPaths>,
}

impl PipelineReport {
    pub fn final_state(&self) -> Option<&RecoveryState> {
        self.states.last()
    }

    /// The terminal failure, if the run ended in one.
    pub fn failure(&self) -> Option<&RecoveryState> {
        self.states
            .iter()
            .rev()
            .find(|state| matches!(state, RecoveryState::Failed { .. }))
    }

    pub fn requires_manual_intervention(&self) -> bool {
        matches!(
            self.failure(),
            Some(RecoveryState::Failed {
                manual_intervention_required: true,
                ..
            })
        )
    }
}

#[derive(Debug)]
struct UploadAttemptError {
    kind: UploadFailure,
    message: String,
    fatal: bool,
}

impl fmt::Display for UploadAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

struct Run {
    report: PipelineReport,
}

impl Run {
    fn enter(&mut self, state: RecoveryState) {
        info!("pipeline: {}", state);
        self.report.logs.push(format!("state: {}", state));
        self.report.states.push(state);
    }

    fn log(&mut self, message: String) {
        info!("{}", message);
        self.report.logs.push(message);
    }

    fn fail(&mut self, reason: String) {
        warn!("pipeline stopped: {}", reason);
        self.enter(RecoveryState::Failed {
            manual_intervention_required: true,
            reason,
        });
    }
}

pub struct RecoveryEngine<'a> {
    toolchain: &'a dyn Toolchain,
    device: &'a dyn DeviceControl,
    settings: RecoverySettings,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(
        toolchain: &'a dyn Toolchain,
        device: &'a dyn DeviceControl,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            toolchain,
            device,
            settings,
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    pub fn run(&self, request: &PipelineRequest) -> PipelineReport {
        let mut run = Run {
            report: PipelineReport::default(),
        };
        run.enter(RecoveryState::Idle);

        let mut ok = self.compile_phase(request, &mut run);
        if ok && request.upload {
            ok = self.upload_phase(request, &mut run);
        }
        if ok {
            if request.monitor {
                if let Some(port) = run.report.port.clone() {
                    run.enter(RecoveryState::Monitoring { port: port.clone() });
                    run.log(format!("serial telemetry available on {}", port));
                }
            }
            run.enter(RecoveryState::Idle);
        }
        run.report.success = ok;

        if let Some(dir) = &request.report_dir {
            self.write_report(dir, request, &mut run);
        }
        run.report
    }

    fn compile_phase(&self, request: &PipelineRequest, run: &mut Run) -> bool {
        let mut fix_rounds = 0;
        let mut timeouts = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            run.enter(RecoveryState::Compiling { attempt });
            let outcome = match self
                .toolchain
                .compile(&request.sketch, &request.fqbn, &request.extra_args)
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_timeout() && timeouts == 0 => {
                    timeouts += 1;
                    run.log(format!("{}; retrying once", err));
                    run.enter(RecoveryState::CompileFailed { errors: 0 });
                    continue;
                }
                Err(err) => {
                    run.fail(err.to_string());
                    return false;
                }
            };

            let success = outcome.success;
            let errors: Vec<Diagnostic> = outcome.report.errors().cloned().collect();
            let output = outcome.result.combined_output();
            run.report.compile = Some(outcome);
            if success {
                run.enter(RecoveryState::CompileSucceeded);
                return true;
            }
            run.enter(RecoveryState::CompileFailed {
                errors: errors.len(),
            });

            if fix_rounds >= self.settings.max_fix_attempts {
                run.fail(format!(
                    "compile still failing after {} fix round(s)",
                    fix_rounds
                ));
                return false;
            }
            fix_rounds += 1;
            run.enter(RecoveryState::AutoFixing {
                attempt: fix_rounds,
            });

            let fix = self.auto_fix(request, &errors, &output);
            for applied in &fix.applied {
                run.log(format!("fix applied: {}", applied));
            }
            for suggestion in &fix.suggestions {
                run.log(format!("suggestion: {}", suggestion));
            }
            let progressed = fix.success;
            let manual = fix.requires_manual_intervention;
            run.report.fixes.merge(fix);

            if manual {
                run.fail("compile errors need a manual fix".to_string());
                return false;
            }
            if !progressed {
                run.fail("no automatic fix applies to the compile errors".to_string());
                return false;
            }
        }
    }

    fn auto_fix(&self, request: &PipelineRequest, errors: &[Diagnostic], output: &str) -> FixResult {
        let mut result = FixResult::default();

        // Line-based patches first; include insertion shifts line numbers.
        let patchable: Vec<Diagnostic> = errors
            .iter()
            .filter(|diag| match diag.code {
                ErrorCode::Syntax => true,
                ErrorCode::Undeclared => sketchforge_process::undeclared_identifier(&diag.message)
                    .map(|ident| include_for(&ident).is_none())
                    .unwrap_or(false),
                _ => false,
            })
            .cloned()
            .collect();
        let mut files: Vec<PathBuf> = Vec::new();
        for diag in &patchable {
            let file = fixes::source_for(&request.sketch, diag);
            if !files.contains(&file) {
                files.push(file);
            }
        }
        for file in files {
            result.merge(fix_syntax_patch(
                &file,
                &patchable,
                self.settings.patch_confidence_threshold,
            ));
        }

        result.merge(fix_include_paths(&request.sketch, errors, self.toolchain));

        if output.contains(COLLISION_MARKER) {
            result.merge(fix_library_collision(self.toolchain));
        }
        result
    }

    fn resolve_port(&self, request: &PipelineRequest, run: &mut Run) -> Option<String> {
        let ports = match self.device.list_ports() {
            Ok(ports) => ports,
            Err(err) => {
                run.fail(format!("port scan failed: {:#}", err));
                return None;
            }
        };

        if let Some(port) = &request.port {
            run.report.device = ports
                .iter()
                .find(|candidate| &candidate.path == port)
                .and_then(|candidate| self.device.identify(candidate));
            return Some(port.clone());
        }

        let mut candidates: Vec<IdentifiedDevice> = ports
            .iter()
            .filter_map(|port| self.device.identify(port))
            .collect();
        candidates.sort_by(|a, b| {
            let a_match = fqbn_matches(&request.fqbn, &a.fqbn);
            let b_match = fqbn_matches(&request.fqbn, &b.fqbn);
            b_match
                .cmp(&a_match)
                .then(b.confidence.total_cmp(&a.confidence))
        });
        match candidates.into_iter().next() {
            Some(device) => {
                run.log(format!(
                    "detected {} ({}) on {} via {:?}",
                    device.board_name, device.fqbn, device.port.path, device.method
                ));
                let port = device.port.path.clone();
                run.report.device = Some(device);
                Some(port)
            }
            None => {
                run.fail("no recognised board connected".to_string());
                None
            }
        }
    }

    fn upload_phase(&self, request: &PipelineRequest, run: &mut Run) -> bool {
        let port = match self.resolve_port(request, run) {
            Some(port) => port,
            None => return false,
        };

        let safety = self.device.safe_guard(&port, &request.fqbn);
        for warning in &safety.warnings {
            run.log(format!("warning: {}", warning));
        }
        run.report.safety_warnings = safety.warnings.clone();
        if !safety.is_safe() {
            run.fail(safety.errors.join("; "));
            return false;
        }

        let policy = RetryPolicy::new(self.settings.max_upload_attempts, self.settings.retry_base_delay)
            .with_alternate_from(2);
        let outcome = retry_with(
            &policy,
            |attempt| {
                if attempt.alternate {
                    self.recover_upload(request, &port, run)
                } else {
                    self.plain_upload(request, &port, attempt.number, run)
                }
            },
            |err: &UploadAttemptError| err.fatal,
        );
        run.report.upload_failures = outcome.failures;

        match outcome.value {
            Some(final_port) => {
                run.enter(RecoveryState::UploadSucceeded {
                    port: final_port.clone(),
                });
                run.report.port = Some(final_port);
                true
            }
            None => {
                let reason = run
                    .report
                    .upload_failures
                    .last()
                    .map(|failure| failure.error.clone())
                    .unwrap_or_else(|| "upload failed".to_string());
                run.fail(format!(
                    "upload to {} failed after {} attempt(s): {}",
                    port, outcome.attempts, reason
                ));
                false
            }
        }
    }

    fn plain_upload(
        &self,
        request: &PipelineRequest,
        port: &str,
        attempt: u32,
        run: &mut Run,
    ) -> Result<String, UploadAttemptError> {
        run.enter(RecoveryState::Uploading {
            attempt,
            port: port.to_string(),
        });
        let result = self
            .toolchain
            .upload(&request.sketch, &request.fqbn, port, &UploadOptions::default());
        let error = match result {
            Ok(result) if result.success() => {
                run.report.upload = Some(result);
                return Ok(port.to_string());
            }
            Ok(result) => {
                let kind = classify_upload_failure(&result.combined_output());
                let message = result
                    .error_text()
                    .unwrap_or_else(|| "uploader exited with an error".to_string());
                run.report.upload = Some(result);
                UploadAttemptError {
                    kind,
                    message,
                    fatal: kind.is_fatal(),
                }
            }
            Err(err) => {
                let kind = UploadFailure::from_tool_error(&err);
                UploadAttemptError {
                    kind,
                    message: err.to_string(),
                    fatal: err.is_fatal(),
                }
            }
        };
        run.enter(RecoveryState::UploadFailed { reason: error.kind });
        Err(error)
    }

    fn recover_upload(
        &self,
        request: &PipelineRequest,
        port: &str,
        run: &mut Run,
    ) -> Result<String, UploadAttemptError> {
        run.enter(RecoveryState::FlashRecovering {
            port: port.to_string(),
        });
        let outcome = flash_recovery(self.device, self.toolchain, port, &request.fqbn, &request.sketch);
        for step in &outcome.manual_steps {
            run.log(format!("manual step: {}", step));
        }
        let result = if outcome.success {
            Ok(outcome.port.clone().unwrap_or_else(|| port.to_string()))
        } else {
            Err(UploadAttemptError {
                kind: UploadFailure::Unknown,
                message: outcome.message.clone(),
                fatal: outcome.requires_manual_intervention,
            })
        };
        run.report.flash_recovery = Some(outcome);
        result
    }

    fn write_report(&self, dir: &std::path::Path, request: &PipelineRequest, run: &mut Run) {
        let devices: Vec<IdentifiedDevice> = run.report.device.iter().cloned().collect();
        let meta = json!({
            "command": "pipeline",
            "sketch": request.sketch.display().to_string(),
            "fqbn": request.fqbn,
            "port": run.report.port,
            "success": run.report.success,
            "states": run.report.states,
            "fixes": run.report.fixes,
            "upload_failures": run.report.upload_failures,
            "flash_recovery": run.report.flash_recovery,
        });
        match create_run_report(dir, &devices, Some(meta), &run.report.logs) {
            Ok(paths) => run.report.report = Some(paths),
            Err(err) => {
                warn!("could not write run report: {:#}", err);
                run.report.logs.push(format!("report not written: {:#}", err));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use anyhow::Result;
    use sketchforge_build::{CompileOutcome, InstalledLibrary, Toolchain, UploadOptions};
    use sketchforge_core::{
        BoardFamily, CommandResult, CompileReport, DevicePort, Diagnostic, IdentifiedDevice,
        ResetMethod, ResetResult, ToolError, ToolResult,
    };
    use sketchforge_device::{BootloaderOutcome, DeviceControl, SafetyReport};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    const DEFAULT_UPLOAD_ERROR: &str = "avrdude: stk500_recv(): programmer is not responding";

    fn command_result(command: String, ok: bool, stderr: &str) -> CommandResult {
        CommandResult {
            command,
            exit_code: Some(if ok { 0 } else { 1 }),
            stderr: stderr.to_string(),
            ..CommandResult::default()
        }
    }

    pub fn compiled(diagnostics: Vec<Diagnostic>) -> ToolResult<CompileOutcome> {
        let success = diagnostics.iter().all(|diag| !diag.is_error());
        let stderr: Vec<String> = diagnostics
            .iter()
            .map(|diag| format!("{}:{}:{}: error: {}", diag.file, diag.line, diag.column, diag.message))
            .collect();
        Ok(CompileOutcome {
            success,
            result: command_result("compile".to_string(), success, &stderr.join("\n")),
            report: CompileReport {
                success,
                diagnostics,
                memory: None,
            },
            binary: None,
            build_dir: PathBuf::from("/tmp/sketchforge-build/test"),
        })
    }

    /// Scripted build tool. Compiles and uploads succeed once their queues
    /// run dry unless `upload_error` is set.
    #[derive(Default)]
    pub struct FakeToolchain {
        pub fail_install: bool,
        pub libraries: Vec<InstalledLibrary>,
        pub upload_error: Option<String>,
        pub missing_uploader: bool,
        pub compiles: Mutex<VecDeque<ToolResult<CompileOutcome>>>,
        pub uploads: Mutex<VecDeque<bool>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeToolchain {
        pub fn with_libraries(mut self, libraries: &[(&str, &str)]) -> Self {
            self.libraries = libraries
                .iter()
                .map(|(name, version)| InstalledLibrary {
                    name: name.to_string(),
                    version: version.to_string(),
                    location: Some("user".to_string()),
                    install_dir: None,
                })
                .collect();
            self
        }

        pub fn with_uploads(self, outcomes: &[bool]) -> Self {
            self.uploads
                .lock()
                .unwrap()
                .extend(outcomes.iter().copied());
            self
        }

        pub fn with_upload_error(mut self, stderr: &str) -> Self {
            self.upload_error = Some(stderr.to_string());
            self
        }

        pub fn without_uploader(mut self) -> Self {
            self.missing_uploader = true;
            self
        }

        pub fn with_compiles(self, outcomes: Vec<ToolResult<CompileOutcome>>) -> Self {
            self.compiles.lock().unwrap().extend(outcomes);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Toolchain for FakeToolchain {
        fn compile(&self, _sketch: &Path, fqbn: &str, _extra_args: &[String]) -> ToolResult<CompileOutcome> {
            self.record(format!("compile {}", fqbn));
            match self.compiles.lock().unwrap().pop_front() {
                Some(outcome) => outcome,
                None => compiled(Vec::new()),
            }
        }

        fn upload(
            &self,
            _sketch: &Path,
            _fqbn: &str,
            port: &str,
            options: &UploadOptions,
        ) -> ToolResult<CommandResult> {
            let speed = options
                .baud
                .map(|baud| baud.to_string())
                .unwrap_or_else(|| "default".to_string());
            self.record(format!("upload {} {}", port, speed));
            if self.missing_uploader {
                return Err(ToolError::Spawn {
                    program: "arduino-cli".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            let ok = match self.uploads.lock().unwrap().pop_front() {
                Some(ok) => ok,
                None => self.upload_error.is_none(),
            };
            let stderr = if ok {
                ""
            } else {
                self.upload_error.as_deref().unwrap_or(DEFAULT_UPLOAD_ERROR)
            };
            Ok(command_result(format!("upload {}", port), ok, stderr))
        }

        fn lib_install(&self, name: &str) -> ToolResult<CommandResult> {
            self.record(format!("lib install {}", name));
            let stderr = if self.fail_install { "library not found" } else { "" };
            Ok(command_result(format!("lib install {}", name), !self.fail_install, stderr))
        }

        fn lib_uninstall(&self, name: &str) -> ToolResult<CommandResult> {
            self.record(format!("lib uninstall {}", name));
            Ok(command_result(format!("lib uninstall {}", name), true, ""))
        }

        fn lib_list(&self) -> ToolResult<Vec<InstalledLibrary>> {
            Ok(self.libraries.clone())
        }
    }

    pub fn uno(path: &str) -> IdentifiedDevice {
        IdentifiedDevice {
            port: DevicePort {
                path: path.to_string(),
                vendor_id: Some(0x2341),
                product_id: Some(0x0043),
                ..DevicePort::default()
            },
            fqbn: "arduino:avr:uno".to_string(),
            board_name: "Arduino Uno".to_string(),
            confidence: 0.9,
            method: sketchforge_core::IdentifyMethod::VidPid,
        }
    }

    /// Connected boards are given up front; resets are recorded.
    #[derive(Default)]
    pub struct FakeDevice {
        pub boards: Vec<IdentifiedDevice>,
        pub bootloader_port: Option<String>,
        pub resets: Mutex<Vec<ResetMethod>>,
    }

    impl FakeDevice {
        pub fn with_boards(boards: Vec<IdentifiedDevice>) -> Self {
            Self {
                boards,
                ..Self::default()
            }
        }

        pub fn resets(&self) -> Vec<ResetMethod> {
            self.resets.lock().unwrap().clone()
        }
    }

    impl DeviceControl for FakeDevice {
        fn list_ports(&self) -> Result<Vec<DevicePort>> {
            Ok(self.boards.iter().map(|board| board.port.clone()).collect())
        }

        fn identify(&self, port: &DevicePort) -> Option<IdentifiedDevice> {
            self.boards
                .iter()
                .find(|board| board.port.path == port.path)
                .cloned()
        }

        fn reset(&self, _port: &str, method: ResetMethod) -> ResetResult {
            self.resets.lock().unwrap().push(method);
            ResetResult {
                method,
                success: true,
                message: "reset".to_string(),
            }
        }

        fn bootloader_mode(&self, _port: &str, family: BoardFamily) -> BootloaderOutcome {
            match family {
                BoardFamily::NativeUsb => BootloaderOutcome {
                    success: self.bootloader_port.is_some(),
                    port: self.bootloader_port.clone(),
                    message: "1200 bps touch".to_string(),
                    manual_steps: vec!["Double-tap the reset button".to_string()],
                },
                BoardFamily::WifiSoc => BootloaderOutcome {
                    success: false,
                    port: None,
                    message: "manual download mode".to_string(),
                    manual_steps: vec![
                        "Hold the BOOT button".to_string(),
                        "Press and release EN/RESET".to_string(),
                    ],
                },
                _ => BootloaderOutcome {
                    success: false,
                    port: None,
                    message: "manual reset".to_string(),
                    manual_steps: vec!["Press reset as the upload starts".to_string()],
                },
            }
        }

        fn safe_guard(&self, port: &str, fqbn: &str) -> SafetyReport {
            let ports = self.list_ports().unwrap_or_default();
            sketchforge_safety::check_upload_target(&ports, port, fqbn)
        }
    }
}
