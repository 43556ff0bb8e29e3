use serde::Serialize;
use sketchforge_core::{BoardFamily, DevicePort};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SafetyReport {
    pub port: String,
    pub fqbn: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SafetyReport {
    pub fn is_safe(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn decision(&self) -> SafetyDecision {
        match self.errors.first() {
            None => SafetyDecision::Allow,
            Some(first) => SafetyDecision::Deny(first.clone()),
        }
    }
}

/// `vendor:arch:board` with an optional fourth `key=value,...` options part.
pub fn is_valid_fqbn(fqbn: &str) -> bool {
    let parts: Vec<&str> = fqbn.split(':').collect();
    if parts.len() < 3 || parts.len() > 4 {
        return false;
    }
    let ident_ok = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
    };
    if !parts[..3].iter().all(|&part| ident_ok(part)) {
        return false;
    }
    match parts.get(3) {
        None => true,
        Some(options) => options.split(',').all(|option| {
            let mut kv = option.splitn(2, '=');
            matches!((kv.next(), kv.next()), (Some(key), Some(value)) if ident_ok(key) && ident_ok(value))
        }),
    }
}

pub fn voltage_advisories(fqbn: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if BoardFamily::is_low_voltage(fqbn) {
        warnings.push(format!(
            "{} runs at 3.3V: do not connect 5V signals to its I/O pins",
            fqbn
        ));
    }
    if BoardFamily::from_fqbn(fqbn) == BoardFamily::WifiSoc {
        warnings.push(
            "WiFi boards draw current spikes during radio use; power from a supply able to deliver 500mA"
                .to_string(),
        );
    }
    warnings
}

/// Pre-flight checks before anything is written to a board.
pub fn check_upload_target(enumerated: &[DevicePort], port: &str, fqbn: &str) -> SafetyReport {
    let mut report = SafetyReport {
        port: port.to_string(),
        fqbn: fqbn.to_string(),
        ..SafetyReport::default()
    };

    if port.trim().is_empty() {
        report.errors.push("Denied: no port selected".to_string());
    } else if !enumerated.iter().any(|candidate| candidate.path == port) {
        report
            .errors
            .push(format!("Denied: port {} is not connected", port));
    }

    if !is_valid_fqbn(fqbn) {
        report.errors.push(format!(
            "Denied: invalid board identifier '{}' (expected vendor:arch:board)",
            fqbn
        ));
    } else {
        report.warnings.extend(voltage_advisories(fqbn));
    }

    report
}
