//! JSON listings from the build tool. Older and newer tool releases wrap the
//! same records differently, so parsing goes through `serde_json::Value`.

use serde::Serialize;
use serde_json::Value;
use sketchforge_core::{ToolError, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardMatch {
    pub name: String,
    pub fqbn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedBoard {
    pub port: String,
    pub protocol: Option<String>,
    pub boards: Vec<BoardMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledLibrary {
    pub name: String,
    pub version: String,
    pub location: Option<String>,
    pub install_dir: Option<String>,
}

fn records<'a>(value: &'a Value, wrapper: &str) -> &'a [Value] {
    value
        .as_array()
        .or_else(|| value.get(wrapper).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn parse_json(output: &str, what: &str) -> ToolResult<Value> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    serde_json::from_str(trimmed).map_err(|err| ToolError::Parse(format!("{}: {}", what, err)))
}

/// Accepts both the bare array and the `{"detected_ports": [...]}` shape.
pub fn parse_board_list(output: &str) -> ToolResult<Vec<DetectedBoard>> {
    let value = parse_json(output, "board list")?;
    Ok(records(&value, "detected_ports")
        .iter()
        .filter_map(|entry| {
            let port_info = entry.get("port").unwrap_or(entry);
            let port = text(port_info, &["address"])?;
            let boards = ["matching_boards", "boards"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_array))
                .map(|boards| {
                    boards
                        .iter()
                        .filter_map(|board| {
                            Some(BoardMatch {
                                name: text(board, &["name"]).unwrap_or_default(),
                                fqbn: text(board, &["fqbn", "FQBN"])?,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(DetectedBoard {
                port,
                protocol: text(port_info, &["protocol"]),
                boards,
            })
        })
        .collect())
}

/// Accepts both the bare array and the `{"installed_libraries": [...]}` shape.
pub fn parse_lib_list(output: &str) -> ToolResult<Vec<InstalledLibrary>> {
    let value = parse_json(output, "lib list")?;
    Ok(records(&value, "installed_libraries")
        .iter()
        .filter_map(|entry| {
            let library = entry.get("library").unwrap_or(entry);
            Some(InstalledLibrary {
                name: text(library, &["name"])?,
                version: text(library, &["version"]).unwrap_or_default(),
                location: text(library, &["location"]),
                install_dir: text(library, &["install_dir"]),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_list_detected_ports_shape() {
        let json = r#"{"detected_ports": [
            {"port": {"address": "/dev/ttyACM0", "protocol": "serial"},
             "matching_boards": [{"name": "Arduino Uno", "fqbn": "arduino:avr:uno"}]},
            {"port": {"address": "/dev/ttyS0", "protocol": "serial"}}
        ]}"#;
        let boards = parse_board_list(json).unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards[0].port, "/dev/ttyACM0");
        assert_eq!(boards[0].boards[0].fqbn, "arduino:avr:uno");
        assert!(boards[1].boards.is_empty());
    }

    #[test]
    fn board_list_legacy_array_shape() {
        let json = r#"[{"address": "COM3", "protocol": "serial",
            "boards": [{"name": "Arduino Mega", "FQBN": "arduino:avr:mega"}]}]"#;
        let boards = parse_board_list(json).unwrap();
        assert_eq!(boards[0].port, "COM3");
        assert_eq!(boards[0].boards[0].fqbn, "arduino:avr:mega");
    }

    #[test]
    fn lib_list_both_shapes() {
        let wrapped = r#"{"installed_libraries": [
            {"library": {"name": "Servo", "version": "1.2.1", "location": "user"}},
            {"library": {"name": "Servo", "version": "1.1.8", "location": "ide_builtin"}}
        ]}"#;
        let libs = parse_lib_list(wrapped).unwrap();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[1].version, "1.1.8");
        assert_eq!(libs[0].location.as_deref(), Some("user"));

        let bare = r#"[{"library": {"name": "DHT sensor library", "version": "1.4.4"}}]"#;
        assert_eq!(parse_lib_list(bare).unwrap()[0].name, "DHT sensor library");
    }

    #[test]
    fn empty_output_is_empty_list() {
        assert!(parse_lib_list("").unwrap().is_empty());
        assert!(parse_lib_list("{}").unwrap().is_empty());
        assert!(matches!(parse_board_list("not json"), Err(ToolError::Parse(_))));
    }
}
