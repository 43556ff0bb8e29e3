use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sketchforge_core::{now_utc_rfc3339, IdentifiedDevice, REPORT_SCHEMA_VERSION};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub devices_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: &'a str,
    created_at_utc: String,
    report_schema_version: &'a str,
    meta: Option<Value>,
}

/// Writes `reports/<run-id>/{run.json,devices.json,logs.txt}` under `base`.
pub fn create_run_report(
    base: impl AsRef<Path>,
    devices: &[IdentifiedDevice],
    meta: Option<Value>,
    logs: &[String],
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report dir {}", root.display()))?;

    let devices_json = root.join("devices.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    std::fs::write(&devices_json, serde_json::to_string_pretty(devices)?)?;

    let run_meta = RunMetadata {
        run_id: &run_id,
        created_at_utc: now_utc_rfc3339(),
        report_schema_version: REPORT_SCHEMA_VERSION,
        meta,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;

    let mut log_data = logs.join("\n");
    if !log_data.is_empty() {
        log_data.push('\n');
    }
    std::fs::write(&logs_path, log_data)?;
    log::info!("run report written to {}", root.display());

    Ok(ReportPaths {
        run_id,
        root,
        devices_json,
        run_json,
        logs_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sketchforge_core::{DevicePort, IdentifyMethod};

    #[test]
    fn bundle_contains_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let devices = vec![IdentifiedDevice {
            port: DevicePort::bare("/dev/ttyACM0"),
            fqbn: "arduino:avr:uno".to_string(),
            board_name: "Arduino Uno".to_string(),
            confidence: 0.9,
            method: IdentifyMethod::VidPid,
        }];
        let logs = vec!["compile ok".to_string(), "upload ok".to_string()];
        let paths = create_run_report(
            dir.path(),
            &devices,
            Some(serde_json::json!({"sketch": "Blink"})),
            &logs,
        )
        .unwrap();

        assert!(paths.root.starts_with(dir.path().join("reports")));
        let run: Value = serde_json::from_str(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["run_id"], paths.run_id.as_str());
        assert_eq!(run["meta"]["sketch"], "Blink");

        let saved: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.devices_json).unwrap()).unwrap();
        assert_eq!(saved[0]["method"], "vid_pid");
        assert_eq!(
            std::fs::read_to_string(&paths.logs_path).unwrap(),
            "compile ok\nupload ok\n"
        );
    }
}
