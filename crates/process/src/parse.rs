//! Pure text → structure parsing of build tool output.

use regex::Regex;
use sketchforge_core::{CompileReport, Diagnostic, ErrorCode, MemoryReport, Severity};
use std::sync::OnceLock;

const LIBRARY_HINTS: &[(&str, &str)] = &[
    (
        "WiFi",
        "Add #include <WiFi.h> on ESP32 or #include <ESP8266WiFi.h> on ESP8266",
    ),
    ("Servo", "Install the Servo library and add #include <Servo.h>"),
    (
        "DHT",
        "Install \"DHT sensor library\" and add #include <DHT.h>",
    ),
    ("Wire", "Add #include <Wire.h> to use the I2C bus"),
    ("SPI", "Add #include <SPI.h> to use the SPI bus"),
    (
        "LiquidCrystal",
        "Install the LiquidCrystal library and add #include <LiquidCrystal.h>",
    ),
    (
        "Adafruit_NeoPixel",
        "Install \"Adafruit NeoPixel\" and add #include <Adafruit_NeoPixel.h>",
    ),
];

fn diagnostic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<file>.+?):(?P<line>\d+):(?P<col>\d+):\s*(?P<sev>fatal error|error|warning|note|info):\s*(?P<msg>.*)$",
        )
        .expect("diagnostic regex")
    })
}

fn flash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Sketch uses (\d+) bytes \((\d+)%\) of program storage space\. Maximum is (\d+) bytes",
        )
        .expect("flash regex")
    })
}

fn sram_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Global variables use (\d+) bytes \((\d+)%\) of dynamic memory, leaving (-?\d+) bytes for local variables\. Maximum is (\d+) bytes",
        )
        .expect("sram regex")
    })
}

fn missing_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([\w./-]+\.h(?:pp)?): No such file or directory").expect("header regex")
    })
}

/// Scans compiler output line by line. `success` is true iff no
/// error-severity diagnostic was found.
pub fn parse_compile(output: &str) -> CompileReport {
    let mut diagnostics = Vec::new();
    let mut memory: Option<MemoryReport> = None;

    for raw in output.lines() {
        let line = raw.trim_end_matches('\r');

        if let Some(caps) = flash_re().captures(line) {
            let report = memory.get_or_insert_with(MemoryReport::default);
            report.flash_bytes = parse_num(&caps[1]);
            report.flash_pct = parse_num::<u8>(&caps[2]);
            report.flash_max = parse_num(&caps[3]);
            continue;
        }
        if let Some(caps) = sram_re().captures(line) {
            let report = memory.get_or_insert_with(MemoryReport::default);
            report.sram_bytes = parse_num(&caps[1]);
            report.sram_pct = parse_num::<u8>(&caps[2]);
            report.sram_free = caps[3].parse::<i64>().map(|v| v.max(0) as u64).unwrap_or(0);
            report.sram_max = parse_num(&caps[4]);
            continue;
        }
        if let Some(diag) = parse_diagnostic_line(line) {
            diagnostics.push(diag);
        }
    }

    let success = !diagnostics.iter().any(Diagnostic::is_error);
    CompileReport {
        success,
        diagnostics,
        memory,
    }
}

pub fn parse_diagnostic_line(line: &str) -> Option<Diagnostic> {
    let caps = diagnostic_re().captures(line.trim())?;
    let message = caps["msg"].trim().to_string();
    let severity = match &caps["sev"] {
        "error" | "fatal error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    };
    Some(Diagnostic {
        file: caps["file"].to_string(),
        line: caps["line"].parse().ok()?,
        column: caps["col"].parse().ok()?,
        code: classify(&message),
        hints: hints_for(&message),
        message,
        severity,
    })
}

pub fn classify(message: &str) -> ErrorCode {
    let lower = message.to_ascii_lowercase();
    if lower.contains("was not declared in this scope") || lower.contains("undeclared") {
        ErrorCode::Undeclared
    } else if lower.contains("undefined reference") {
        ErrorCode::UndefinedReference
    } else if lower.contains("does not name a type")
        || lower.contains("unknown type name")
        || lower.contains("has not been declared")
        || lower.contains("is not a type")
    {
        ErrorCode::UnknownType
    } else if lower.starts_with("expected")
        || lower.contains("stray '")
        || lower.contains("missing terminating")
        || lower.contains("syntax")
    {
        ErrorCode::Syntax
    } else {
        ErrorCode::Generic
    }
}

fn hints_for(message: &str) -> Vec<String> {
    let mut hints: Vec<String> = LIBRARY_HINTS
        .iter()
        .filter(|(needle, _)| message.contains(needle))
        .map(|(_, hint)| hint.to_string())
        .collect();
    if let Some(caps) = missing_header_re().captures(message) {
        hints.push(format!("Install the library that provides {}", &caps[1]));
    }
    hints
}

/// Extracts the identifier quoted in an "undeclared" message. GCC quotes with
/// either ASCII apostrophes or typographic quotes depending on locale.
pub fn undeclared_identifier(message: &str) -> Option<String> {
    let start = message.find(['\'', '‘'])?;
    let rest = &message[start..];
    let opener = rest.chars().next()?;
    let body = &rest[opener.len_utf8()..];
    let end = body.find(['\'', '’'])?;
    let ident = body[..end].trim();
    if ident.is_empty() {
        None
    } else {
        Some(ident.to_string())
    }
}

fn parse_num<T: std::str::FromStr + Default>(value: &str) -> T {
    value.parse::<T>().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNO_OUTPUT: &str = "\
Sketch uses 2018 bytes (6%) of program storage space. Maximum is 32256 bytes.
Global variables use 188 bytes (9%) of dynamic memory, leaving 1860 bytes for local variables. Maximum is 2048 bytes.
";

    #[test]
    fn undeclared_identifier_diagnostic() {
        let report = parse_compile("sketch.ino:10:5: error: 'foo' was not declared in this scope\n");
        assert!(!report.success);
        assert_eq!(report.diagnostics.len(), 1);
        let diag = &report.diagnostics[0];
        assert_eq!(diag.file, "sketch.ino");
        assert_eq!(diag.line, 10);
        assert_eq!(diag.column, 5);
        assert_eq!(diag.code, ErrorCode::Undeclared);
        assert_eq!(diag.message, "'foo' was not declared in this scope");
        assert_eq!(diag.severity, Severity::Error);
    }

    #[test]
    fn memory_summary_lines() {
        let report = parse_compile(UNO_OUTPUT);
        assert!(report.success);
        assert!(report.diagnostics.is_empty());
        let memory = report.memory.expect("memory report");
        assert_eq!(memory.flash_bytes, 2018);
        assert_eq!(memory.flash_pct, 6);
        assert_eq!(memory.flash_max, 32256);
        assert_eq!(memory.sram_bytes, 188);
        assert_eq!(memory.sram_pct, 9);
        assert_eq!(memory.sram_free, 1860);
        assert_eq!(memory.sram_max, 2048);
    }

    #[test]
    fn no_memory_report_without_summary() {
        let report = parse_compile("Compiling sketch...\nUsing library Servo\n");
        assert!(report.memory.is_none());
        assert!(report.success);
    }

    #[test]
    fn only_grammar_lines_become_diagnostics() {
        let output = "\
/tmp/build/sketch.ino.cpp: In function 'void loop()':
/home/me/blink/blink.ino:12:3: error: expected ';' before '}' token
/home/me/blink/blink.ino:4:10: warning: unused variable 'x' [-Wunused-variable]
/home/me/blink/blink.ino:4:10: note: declared here
collect2: error: ld returned 1 exit status
";
        let report = parse_compile(output);
        assert_eq!(report.diagnostics.len(), 3);
        assert_eq!(report.diagnostics[0].code, ErrorCode::Syntax);
        assert_eq!(report.diagnostics[1].severity, Severity::Warning);
        assert_eq!(report.diagnostics[2].severity, Severity::Info);
        assert_eq!(report.errors().count(), 1);
        assert!(!report.success);
    }

    #[test]
    fn warnings_alone_are_success() {
        let report = parse_compile("a.ino:1:1: warning: comparison of integer expressions\n");
        assert!(report.success);
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn windows_paths_keep_drive_letter() {
        let diag = parse_diagnostic_line(
            r"C:\Users\me\sketch\sketch.ino:7:1: error: 'Servo' does not name a type",
        )
        .unwrap();
        assert_eq!(diag.file, r"C:\Users\me\sketch\sketch.ino");
        assert_eq!(diag.line, 7);
        assert_eq!(diag.code, ErrorCode::UnknownType);
        assert_eq!(diag.hints.len(), 1);
        assert!(diag.hints[0].contains("Servo.h"));
    }

    #[test]
    fn wifi_hint_and_missing_header_hint() {
        let diag = parse_diagnostic_line(
            "net.ino:3:10: fatal error: WiFi.h: No such file or directory",
        )
        .unwrap();
        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.code, ErrorCode::Generic);
        assert!(diag.hints[0].contains("ESP8266WiFi.h"));
        assert_eq!(diag.hints[1], "Install the library that provides WiFi.h");
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify("undefined reference to `setup'"), ErrorCode::UndefinedReference);
        assert_eq!(classify("unknown type name 'uint8'"), ErrorCode::UnknownType);
        assert_eq!(classify("stray '\\302' in program"), ErrorCode::Syntax);
        assert_eq!(classify("invalid conversion from 'int' to 'char*'"), ErrorCode::Generic);
    }

    #[test]
    fn extracts_quoted_identifier() {
        assert_eq!(
            undeclared_identifier("'dht' was not declared in this scope").as_deref(),
            Some("dht")
        );
        assert_eq!(
            undeclared_identifier("‘Wire’ was not declared in this scope").as_deref(),
            Some("Wire")
        );
        assert_eq!(undeclared_identifier("no quotes here"), None);
    }
}
