use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;

pub mod config;
pub mod error;
pub mod lines;

pub use config::{load_config, ToolConfig};
pub use error::{ToolError, ToolResult};
pub use lines::LineBuffer;

pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: Option<i32>, // None when terminated by a signal
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
    pub diagnostics: Option<Vec<Diagnostic>>,
    pub memory: Option<MemoryReport>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the order the compiler parser expects.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }

    pub fn error_text(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let text = self.stderr.trim();
        if text.is_empty() {
            Some(format!("{} exited with {:?}", self.command, self.exit_code))
        } else {
            Some(text.to_string())
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[serde(rename = "E_UNDECLARED")]
    Undeclared,
    #[serde(rename = "E_UNDEFINED_REFERENCE")]
    UndefinedReference,
    #[serde(rename = "E_SYNTAX")]
    Syntax,
    #[serde(rename = "E_UNKNOWN_TYPE")]
    UnknownType,
    #[serde(rename = "E_GENERIC")]
    Generic,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Undeclared => "E_UNDECLARED",
            ErrorCode::UndefinedReference => "E_UNDEFINED_REFERENCE",
            ErrorCode::Syntax => "E_SYNTAX",
            ErrorCode::UnknownType => "E_UNKNOWN_TYPE",
            ErrorCode::Generic => "E_GENERIC",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub code: ErrorCode,
    pub message: String,
    pub hints: Vec<String>,
    pub severity: Severity,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MemoryReport {
    pub flash_bytes: u64,
    pub flash_pct: u8,
    pub flash_max: u64,
    pub sram_bytes: u64,
    pub sram_pct: u8,
    pub sram_free: u64,
    pub sram_max: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CompileReport {
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub memory: Option<MemoryReport>,
}

impl CompileReport {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|diag| diag.is_error())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DevicePort {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
    pub friendly_name: Option<String>,
}

impl DevicePort {
    pub fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Lowercase `"vvvv:pppp"` key used by the signature table.
    pub fn signature(&self) -> Option<String> {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => Some(format!("{:04x}:{:04x}", vid, pid)),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyMethod {
    VidPid,
    Manufacturer,
    ToolProbe,
    BootloaderProbe,
}

impl IdentifyMethod {
    pub fn confidence(&self) -> f32 {
        match self {
            IdentifyMethod::VidPid => 0.9,
            IdentifyMethod::Manufacturer => 0.7,
            IdentifyMethod::ToolProbe => 0.8,
            IdentifyMethod::BootloaderProbe => 0.5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IdentifiedDevice {
    pub port: DevicePort,
    pub fqbn: String,
    pub board_name: String,
    pub confidence: f32,
    pub method: IdentifyMethod,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoardFamily {
    Classic,
    NativeUsb,
    WifiSoc,
    Unknown,
}

impl BoardFamily {
    pub fn from_fqbn(fqbn: &str) -> Self {
        let mut parts = fqbn.split(':').skip(1);
        let arch = parts.next().unwrap_or("").to_ascii_lowercase();
        let board = parts.next().unwrap_or("").to_ascii_lowercase();

        if arch == "esp32" || arch == "esp8266" {
            return BoardFamily::WifiSoc;
        }
        if arch == "samd"
            || arch == "sam"
            || arch == "rp2040"
            || arch == "renesas_uno"
            || arch.starts_with("mbed")
            || arch == "nrf52"
        {
            return BoardFamily::NativeUsb;
        }
        if arch == "avr" {
            if matches!(board.as_str(), "leonardo" | "micro" | "promicro" | "yun" | "esplora") {
                return BoardFamily::NativeUsb;
            }
            return BoardFamily::Classic;
        }
        BoardFamily::Unknown
    }

    /// Boards whose I/O pins are not 5 V tolerant.
    pub fn is_low_voltage(fqbn: &str) -> bool {
        let arch = fqbn.split(':').nth(1).unwrap_or("").to_ascii_lowercase();
        matches!(
            arch.as_str(),
            "samd" | "sam" | "esp32" | "esp8266" | "rp2040" | "nrf52"
        ) || arch.starts_with("mbed")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FixResult {
    pub success: bool,
    pub applied: Vec<String>,
    pub suggestions: Vec<String>,
    pub requires_manual_intervention: bool,
    pub modified_files: Vec<PathBuf>,
}

impl FixResult {
    pub fn merge(&mut self, other: FixResult) {
        self.success |= other.success;
        self.applied.extend(other.applied);
        self.suggestions.extend(other.suggestions);
        self.requires_manual_intervention |= other.requires_manual_intervention;
        for path in other.modified_files {
            if !self.modified_files.contains(&path) {
                self.modified_files.push(path);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResetMethod {
    DtrRts,
    Touch1200,
    Auto,
}

impl ResetMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dtr" | "dtr_rts" | "dtr-rts" => Some(ResetMethod::DtrRts),
            "1200" | "1200bps" | "touch_1200" | "touch-1200" => Some(ResetMethod::Touch1200),
            "auto" => Some(ResetMethod::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResetResult {
    pub method: ResetMethod,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ExpectOutcome {
    pub matched: bool,
    pub capture: Option<String>,
    pub logs: Vec<String>,
    pub elapsed_ms: u128,
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_lowercase_padded_hex() {
        let port = DevicePort {
            path: "/dev/ttyACM0".to_string(),
            vendor_id: Some(0x2341),
            product_id: Some(0x43),
            ..DevicePort::default()
        };
        assert_eq!(port.signature().as_deref(), Some("2341:0043"));
        assert_eq!(DevicePort::bare("COM3").signature(), None);
    }

    #[test]
    fn board_family_from_fqbn() {
        assert_eq!(BoardFamily::from_fqbn("arduino:avr:uno"), BoardFamily::Classic);
        assert_eq!(BoardFamily::from_fqbn("arduino:avr:leonardo"), BoardFamily::NativeUsb);
        assert_eq!(BoardFamily::from_fqbn("arduino:samd:mkr1000"), BoardFamily::NativeUsb);
        assert_eq!(BoardFamily::from_fqbn("esp32:esp32:esp32"), BoardFamily::WifiSoc);
        assert_eq!(BoardFamily::from_fqbn("nonsense"), BoardFamily::Unknown);
        assert!(BoardFamily::is_low_voltage("esp8266:esp8266:nodemcuv2"));
        assert!(!BoardFamily::is_low_voltage("arduino:avr:uno"));
    }

    #[test]
    fn error_code_serializes_as_tag() {
        let json = serde_json::to_string(&ErrorCode::Undeclared).unwrap();
        assert_eq!(json, "\"E_UNDECLARED\"");
        assert_eq!(ErrorCode::UnknownType.as_str(), "E_UNKNOWN_TYPE");
    }

    #[test]
    fn command_result_error_text() {
        let ok = CommandResult {
            command: "arduino-cli version".to_string(),
            exit_code: Some(0),
            ..CommandResult::default()
        };
        assert!(ok.error_text().is_none());

        let failed = CommandResult {
            command: "arduino-cli upload".to_string(),
            exit_code: Some(1),
            stderr: "  avrdude: ser_open(): can't open device  \n".to_string(),
            ..CommandResult::default()
        };
        assert_eq!(
            failed.error_text().as_deref(),
            Some("avrdude: ser_open(): can't open device")
        );
    }

    #[test]
    fn fix_results_merge_without_duplicate_paths() {
        let mut first = FixResult {
            success: true,
            applied: vec!["a".to_string()],
            modified_files: vec![PathBuf::from("sketch.ino")],
            ..FixResult::default()
        };
        first.merge(FixResult {
            suggestions: vec!["b".to_string()],
            requires_manual_intervention: true,
            modified_files: vec![PathBuf::from("sketch.ino")],
            ..FixResult::default()
        });
        assert!(first.success);
        assert!(first.requires_manual_intervention);
        assert_eq!(first.modified_files.len(), 1);
        assert_eq!(first.suggestions, vec!["b".to_string()]);
    }
}
