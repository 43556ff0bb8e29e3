//! Staged upload recovery: reset, slower baud rates, then bootloader entry.

use log::{info, warn};
use serde::Serialize;
use sketchforge_build::{Toolchain, UploadOptions};
use sketchforge_core::{BoardFamily, CommandResult, ResetMethod, ToolError};
use sketchforge_device::DeviceControl;
use std::fmt;
use std::path::Path;

/// Tried in order once a plain reset + upload has failed.
pub const FALLBACK_BAUDS: [u32; 3] = [115_200, 57_600, 19_200];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFailure {
    PortBusy,
    BoardMismatch,
    BootloaderTiming,
    PortNotFound,
    ToolUnavailable,
    Unknown,
}

impl UploadFailure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, UploadFailure::PortNotFound | UploadFailure::ToolUnavailable)
    }

    /// Kind for an upload that produced no tool result at all.
    pub fn from_tool_error(err: &ToolError) -> Self {
        match err {
            ToolError::Spawn { .. } => UploadFailure::ToolUnavailable,
            ToolError::PortNotFound(_) => UploadFailure::PortNotFound,
            ToolError::Timeout { .. } => UploadFailure::BootloaderTiming,
            _ => UploadFailure::Unknown,
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            UploadFailure::PortBusy => "Close any serial monitor or program using the port",
            UploadFailure::BoardMismatch => "Check the selected board matches the connected hardware",
            UploadFailure::BootloaderTiming => "Press reset as the upload starts, or try a slower upload speed",
            UploadFailure::PortNotFound => "Reconnect the board and check the USB cable",
            UploadFailure::ToolUnavailable => "Install arduino-cli or set the tool path in the configuration",
            UploadFailure::Unknown => "Check the uploader output for details",
        }
    }
}

const NOT_FOUND: &[&str] = &[
    "port not found",
    "no device found",
    "the port doesn't exist",
];
/// Only count as a missing port on a line that is about the port itself;
/// the same wording is used for a missing input binary.
const MISSING: &[&str] = &[
    "no such file or directory",
    "cannot find the file",
    "could not find",
    "does not exist",
];
const PORT_CONTEXT: &[&str] = &[
    "ser_open",
    "can't open device",
    "could not open port",
    "serial port",
    "/dev/tty",
    "/dev/cu.",
];
const BUSY: &[&str] = &[
    "resource busy",
    "port is busy",
    "access is denied",
    "permission denied",
    "could not open port",
];
const MISMATCH: &[&str] = &[
    "device signature",
    "expected signature",
    "wrong microcontroller",
    "chip is not",
    "unexpected chip id",
];
const TIMING: &[&str] = &[
    "not in sync",
    "not responding",
    "timed out",
    "timeout",
    "failed to connect",
    "wrong boot mode",
    "no response",
    "waiting for packet header",
];

/// Classifies uploader stderr. Missing ports are checked first because a
/// missing device usually also mentions a failed open.
pub fn classify_upload_failure(output: &str) -> UploadFailure {
    let lower = output.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
    let port_missing = lower.lines().any(|line| {
        let has = |needles: &[&str]| needles.iter().any(|needle| line.contains(needle));
        has(PORT_CONTEXT) && has(MISSING)
    });
    if any(NOT_FOUND) || port_missing {
        UploadFailure::PortNotFound
    } else if any(BUSY) {
        UploadFailure::PortBusy
    } else if any(MISMATCH) {
        UploadFailure::BoardMismatch
    } else if any(TIMING) {
        UploadFailure::BootloaderTiming
    } else {
        UploadFailure::Unknown
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageAttempt {
    pub stage: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    /// Stage that got the firmware on the board.
    pub method: Option<String>,
    pub message: String,
    /// Port the successful upload went to; differs from the requested port
    /// after bootloader entry.
    pub port: Option<String>,
    pub stages: Vec<StageAttempt>,
    pub requires_manual_intervention: bool,
    pub manual_steps: Vec<String>,
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} stage(s))", self.message, self.stages.len())
    }
}

struct StageLog {
    stages: Vec<StageAttempt>,
    last_failure: UploadFailure,
}

impl StageLog {
    fn upload(
        &mut self,
        stage: String,
        toolchain: &dyn Toolchain,
        sketch: &Path,
        fqbn: &str,
        port: &str,
        options: &UploadOptions,
    ) -> bool {
        let (success, message) = match toolchain.upload(sketch, fqbn, port, options) {
            Ok(result) if result.success() => (true, "upload succeeded".to_string()),
            Ok(result) => {
                self.last_failure = classify_result(&result);
                (false, result.error_text().unwrap_or_default())
            }
            Err(ToolError::PortNotFound(message)) => {
                self.last_failure = UploadFailure::PortNotFound;
                (false, message)
            }
            Err(err) => {
                let kind = UploadFailure::from_tool_error(&err);
                if kind != UploadFailure::Unknown {
                    self.last_failure = kind;
                }
                (false, err.to_string())
            }
        };
        info!("flash recovery stage {}: {}", stage, if success { "ok" } else { "failed" });
        self.stages.push(StageAttempt {
            stage,
            success,
            message,
        });
        success
    }

    fn note(&mut self, stage: &str, success: bool, message: String) {
        self.stages.push(StageAttempt {
            stage: stage.to_string(),
            success,
            message,
        });
    }

    fn succeeded(self, stage: &str, port: &str) -> RecoveryOutcome {
        RecoveryOutcome {
            success: true,
            method: Some(stage.to_string()),
            message: format!("Upload succeeded via {}", stage),
            port: Some(port.to_string()),
            stages: self.stages,
            requires_manual_intervention: false,
            manual_steps: Vec::new(),
        }
    }

    fn stopped(self, port: &str) -> RecoveryOutcome {
        let message = match self.last_failure {
            UploadFailure::ToolUnavailable => "Upload tool is not available".to_string(),
            _ => format!("{} disappeared during recovery", port),
        };
        self.gave_up(message, Vec::new())
    }

    fn gave_up(self, message: String, mut manual_steps: Vec<String>) -> RecoveryOutcome {
        manual_steps.push(self.last_failure.advice().to_string());
        RecoveryOutcome {
            success: false,
            method: None,
            message,
            port: None,
            stages: self.stages,
            requires_manual_intervention: true,
            manual_steps,
        }
    }
}

fn classify_result(result: &CommandResult) -> UploadFailure {
    classify_upload_failure(&result.combined_output())
}

/// Runs the fallback ladder for one port. WiFi-class boards only get manual
/// download-mode instructions; blind retries cannot put them in bootloader.
pub fn flash_recovery(
    device: &dyn DeviceControl,
    toolchain: &dyn Toolchain,
    port: &str,
    fqbn: &str,
    sketch: &Path,
) -> RecoveryOutcome {
    let family = BoardFamily::from_fqbn(fqbn);
    let mut log = StageLog {
        stages: Vec::new(),
        last_failure: UploadFailure::Unknown,
    };

    if family == BoardFamily::WifiSoc {
        let manual = device.bootloader_mode(port, family);
        log.note("manual_boot", false, manual.message.clone());
        warn!("{} needs manual download mode", port);
        return RecoveryOutcome {
            success: false,
            method: None,
            message: "Hold the BOOT button and retry the upload".to_string(),
            port: Some(port.to_string()),
            stages: log.stages,
            requires_manual_intervention: true,
            manual_steps: manual.manual_steps,
        };
    }

    let reset = device.reset(port, ResetMethod::DtrRts);
    log.note("reset_dtr_rts", reset.success, reset.message);
    if log.upload(
        "reset_upload".to_string(),
        toolchain,
        sketch,
        fqbn,
        port,
        &UploadOptions::default(),
    ) {
        return log.succeeded("reset_upload", port);
    }
    if log.last_failure.is_fatal() {
        return log.stopped(port);
    }

    for baud in FALLBACK_BAUDS {
        let stage = format!("baud_{}", baud);
        let options = UploadOptions {
            baud: Some(baud),
            ..UploadOptions::default()
        };
        if log.upload(stage.clone(), toolchain, sketch, fqbn, port, &options) {
            return log.succeeded(&stage, port);
        }
        if log.last_failure.is_fatal() {
            return log.stopped(port);
        }
    }

    let mut manual_steps = Vec::new();
    if family == BoardFamily::NativeUsb {
        let bootloader = device.bootloader_mode(port, family);
        log.note("bootloader_1200", bootloader.success, bootloader.message.clone());
        match bootloader.port {
            Some(boot_port) if bootloader.success => {
                if log.upload(
                    "bootloader_upload".to_string(),
                    toolchain,
                    sketch,
                    fqbn,
                    &boot_port,
                    &UploadOptions::default(),
                ) {
                    return log.succeeded("bootloader_upload", &boot_port);
                }
            }
            _ => manual_steps.extend(bootloader.manual_steps),
        }
    }

    log.gave_up(
        format!("All recovery stages failed for {}", port),
        manual_steps,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, FakeToolchain};

    #[test]
    fn classifies_common_uploader_errors() {
        assert_eq!(
            classify_upload_failure("avrdude: ser_open(): can't open device \"/dev/ttyACM0\": Device or resource busy"),
            UploadFailure::PortBusy
        );
        assert_eq!(
            classify_upload_failure("avrdude: ser_open(): can't open device \"/dev/ttyACM0\": No such file or directory"),
            UploadFailure::PortNotFound
        );
        assert_eq!(
            classify_upload_failure("avrdude: Expected signature for ATmega328P is 1E 95 0F"),
            UploadFailure::BoardMismatch
        );
        assert_eq!(
            classify_upload_failure("avrdude: stk500_recv(): programmer is not responding"),
            UploadFailure::BootloaderTiming
        );
        assert_eq!(
            classify_upload_failure("A fatal error occurred: Failed to connect to ESP32: Wrong boot mode detected"),
            UploadFailure::BootloaderTiming
        );
        assert_eq!(classify_upload_failure("something odd"), UploadFailure::Unknown);
    }

    #[test]
    fn missing_input_file_is_not_a_missing_port() {
        let output = "avrdude: can't open input file /tmp/build/Blink.ino.hex: No such file or directory\n\
                      avrdude: read from file '/tmp/build/Blink.ino.hex' failed";
        assert_eq!(classify_upload_failure(output), UploadFailure::Unknown);
        assert!(!classify_upload_failure(output).is_fatal());
        assert_eq!(
            classify_upload_failure("could not open port 'COM7': FileNotFoundError(2, 'The system cannot find the file specified.')"),
            UploadFailure::PortNotFound
        );
    }

    #[test]
    fn missing_uploader_is_its_own_failure() {
        let spawn = ToolError::Spawn {
            program: "arduino-cli".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(UploadFailure::from_tool_error(&spawn), UploadFailure::ToolUnavailable);
        assert_eq!(
            UploadFailure::from_tool_error(&ToolError::PortNotFound("/dev/ttyACM0".to_string())),
            UploadFailure::PortNotFound
        );
        assert!(UploadFailure::ToolUnavailable.is_fatal());
        assert!(UploadFailure::ToolUnavailable.advice().contains("arduino-cli"));

        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default().without_uploader();
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyACM0", "arduino:avr:uno", Path::new("Blink"));
        assert!(!outcome.success);
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.message, "Upload tool is not available");
        assert!(outcome.manual_steps.iter().any(|step| step.contains("arduino-cli")));
    }

    #[test]
    fn reset_then_upload_wins_first() {
        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default().with_uploads(&[true]);
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyUSB0", "arduino:avr:nano", Path::new("Blink"));
        assert!(outcome.success);
        assert_eq!(outcome.method.as_deref(), Some("reset_upload"));
        assert_eq!(device.resets(), vec![ResetMethod::DtrRts]);
    }

    #[test]
    fn each_fallback_baud_is_a_real_upload() {
        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default().with_uploads(&[false, false, true]);
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyUSB0", "arduino:avr:nano", Path::new("Blink"));
        assert!(outcome.success);
        assert_eq!(outcome.method.as_deref(), Some("baud_57600"));
        assert_eq!(
            toolchain.calls(),
            vec![
                "upload /dev/ttyUSB0 default",
                "upload /dev/ttyUSB0 115200",
                "upload /dev/ttyUSB0 57600",
            ]
        );
    }

    #[test]
    fn native_usb_ends_with_bootloader_port() {
        let device = FakeDevice {
            bootloader_port: Some("/dev/ttyACM1".to_string()),
            ..FakeDevice::default()
        };
        let toolchain = FakeToolchain::default().with_uploads(&[false, false, false, false, true]);
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyACM0", "arduino:samd:mkr1000", Path::new("Blink"));
        assert!(outcome.success);
        assert_eq!(outcome.method.as_deref(), Some("bootloader_upload"));
        assert_eq!(outcome.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(toolchain.calls().last().unwrap(), "upload /dev/ttyACM1 default");
    }

    #[test]
    fn classic_board_gives_up_with_manual_steps() {
        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default()
            .with_upload_error("avrdude: stk500_getsync(): not in sync: resp=0x00");
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyUSB0", "arduino:avr:uno", Path::new("Blink"));
        assert!(!outcome.success);
        assert!(outcome.requires_manual_intervention);
        assert_eq!(outcome.stages.len(), 1 + 1 + FALLBACK_BAUDS.len());
        assert!(outcome.manual_steps.iter().any(|step| step.contains("reset")));
    }

    #[test]
    fn wifi_boards_are_not_blindly_retried() {
        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default();
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyUSB0", "esp32:esp32:esp32", Path::new("Blink"));
        assert!(!outcome.success);
        assert!(outcome.requires_manual_intervention);
        assert!(outcome.message.contains("BOOT"));
        assert!(toolchain.calls().is_empty());
        assert!(device.resets().is_empty());
    }

    #[test]
    fn missing_port_stops_the_ladder() {
        let device = FakeDevice::default();
        let toolchain = FakeToolchain::default()
            .with_upload_error("can't open device: No such file or directory");
        let outcome = flash_recovery(&device, &toolchain, "/dev/ttyUSB0", "arduino:avr:uno", Path::new("Blink"));
        assert!(!outcome.success);
        assert_eq!(toolchain.calls().len(), 1);
        assert!(outcome.manual_steps.iter().any(|step| step.contains("Reconnect")));
    }
}
