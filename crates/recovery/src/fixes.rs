//! Automatic source and library fixes driven by compiler diagnostics.

use log::{debug, info, warn};
use sketchforge_build::{sketch_name, InstalledLibrary, Toolchain};
use sketchforge_core::{Diagnostic, ErrorCode, FixResult};
use sketchforge_process::undeclared_identifier;
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub struct IncludeFix {
    pub identifier: &'static str,
    pub header: &'static str,
    /// Library to install alongside the include; `None` for headers that ship
    /// with the board core.
    pub library: Option<&'static str>,
}

const fn fix(
    identifier: &'static str,
    header: &'static str,
    library: Option<&'static str>,
) -> IncludeFix {
    IncludeFix {
        identifier,
        header,
        library,
    }
}

pub const INCLUDE_TABLE: &[IncludeFix] = &[
    fix("Servo", "Servo.h", Some("Servo")),
    fix("WiFi", "WiFi.h", None),
    fix("WiFiClient", "WiFi.h", None),
    fix("WiFiServer", "WiFi.h", None),
    fix("HTTPClient", "HTTPClient.h", None),
    fix("Wire", "Wire.h", None),
    fix("SPI", "SPI.h", None),
    fix("EEPROM", "EEPROM.h", None),
    fix("SoftwareSerial", "SoftwareSerial.h", None),
    fix("DHT", "DHT.h", Some("DHT sensor library")),
    fix("DHT11", "DHT.h", Some("DHT sensor library")),
    fix("DHT22", "DHT.h", Some("DHT sensor library")),
    fix("LiquidCrystal", "LiquidCrystal.h", Some("LiquidCrystal")),
    fix("LiquidCrystal_I2C", "LiquidCrystal_I2C.h", Some("LiquidCrystal I2C")),
    fix("Adafruit_NeoPixel", "Adafruit_NeoPixel.h", Some("Adafruit NeoPixel")),
    fix("Adafruit_SSD1306", "Adafruit_SSD1306.h", Some("Adafruit SSD1306")),
    fix("Stepper", "Stepper.h", Some("Stepper")),
    fix("OneWire", "OneWire.h", Some("OneWire")),
    fix("DallasTemperature", "DallasTemperature.h", Some("DallasTemperature")),
    fix("SD", "SD.h", Some("SD")),
    fix("File", "SD.h", Some("SD")),
    fix("StaticJsonDocument", "ArduinoJson.h", Some("ArduinoJson")),
    fix("DynamicJsonDocument", "ArduinoJson.h", Some("ArduinoJson")),
    fix("JsonDocument", "ArduinoJson.h", Some("ArduinoJson")),
    fix("PubSubClient", "PubSubClient.h", Some("PubSubClient")),
    fix("Keypad", "Keypad.h", Some("Keypad")),
    fix("IRrecv", "IRremote.h", Some("IRremote")),
    fix("FastLED", "FastLED.h", Some("FastLED")),
    fix("CRGB", "FastLED.h", Some("FastLED")),
];

pub fn include_for(identifier: &str) -> Option<&'static IncludeFix> {
    INCLUDE_TABLE.iter().find(|fix| fix.identifier == identifier)
}

fn main_sketch(project: &Path) -> PathBuf {
    if project.is_file() {
        project.to_path_buf()
    } else {
        project.join(format!("{}.ino", sketch_name(project)))
    }
}

/// The file a diagnostic points at, looked up inside the project when the
/// tool reported a path from its temporary build copy.
pub(crate) fn source_for(project: &Path, diagnostic: &Diagnostic) -> PathBuf {
    let reported = PathBuf::from(&diagnostic.file);
    if reported.is_file() {
        return reported;
    }
    let dir = if project.is_file() {
        project.parent().map(Path::to_path_buf)
    } else {
        Some(project.to_path_buf())
    };
    if let (Some(dir), Some(name)) = (dir, reported.file_name()) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return candidate;
        }
    }
    main_sketch(project)
}

fn line_ending(source: &str) -> &'static str {
    if source.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

fn is_include(line: &str) -> bool {
    line.trim_start().starts_with("#include")
}

/// Returns the updated source, or `None` when `header` is already included.
pub fn insert_include(source: &str, header: &str) -> Option<String> {
    let angle = format!("<{}>", header);
    let quoted = format!("\"{}\"", header);
    let already = source
        .lines()
        .any(|line| is_include(line) && (line.contains(&angle) || line.contains(&quoted)));
    if already {
        return None;
    }

    let eol = line_ending(source);
    let directive = format!("#include {}{}", angle, eol);
    let mut chunks: Vec<&str> = source.split_inclusive('\n').collect();
    let at = chunks
        .iter()
        .rposition(|line| is_include(line))
        .map(|idx| idx + 1)
        .unwrap_or(0);

    let mut out = String::with_capacity(source.len() + directive.len() + 1);
    let needs_break = at > 0 && !chunks[at - 1].ends_with('\n');
    for chunk in chunks.drain(..at) {
        out.push_str(chunk);
    }
    if needs_break {
        out.push_str(eol);
    }
    out.push_str(&directive);
    for chunk in chunks {
        out.push_str(chunk);
    }
    Some(out)
}

/// Adds missing `#include` lines for undeclared identifiers and unknown types
/// with a known header, and installs the matching library. Running it again
/// on a fixed project changes nothing.
pub fn fix_include_paths(
    project: &Path,
    diagnostics: &[Diagnostic],
    toolchain: &dyn Toolchain,
) -> FixResult {
    let mut result = FixResult::default();
    let mut sources: BTreeMap<PathBuf, (String, bool)> = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut installed: Vec<&'static str> = Vec::new();

    for diagnostic in diagnostics
        .iter()
        .filter(|d| matches!(d.code, ErrorCode::Undeclared | ErrorCode::UnknownType))
    {
        let Some(identifier) = undeclared_identifier(&diagnostic.message) else {
            continue;
        };
        let path = source_for(project, diagnostic);
        if !seen.insert((path.clone(), identifier.clone())) {
            continue;
        }

        let Some(entry) = include_for(&identifier) else {
            result.suggestions.push(format!(
                "'{}' is not declared in {}: declare it or include the header that defines it",
                identifier,
                path.display()
            ));
            result.requires_manual_intervention = true;
            continue;
        };

        let source = match sources.entry(path.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match std::fs::read_to_string(&path) {
                Ok(text) => slot.insert((text, false)),
                Err(err) => {
                    result.suggestions.push(format!(
                        "Add #include <{}> to {} (could not read it: {})",
                        entry.header,
                        path.display(),
                        err
                    ));
                    result.requires_manual_intervention = true;
                    continue;
                }
            },
        };

        let Some(updated) = insert_include(&source.0, entry.header) else {
            debug!("{} already includes {}", path.display(), entry.header);
            continue;
        };
        source.0 = updated;
        source.1 = true;
        result
            .applied
            .push(format!("Added #include <{}> to {}", entry.header, path.display()));

        if let Some(library) = entry.library {
            if installed.contains(&library) {
                continue;
            }
            installed.push(library);
            match toolchain.lib_install(library) {
                Ok(outcome) if outcome.success() => {
                    result.applied.push(format!("Installed library \"{}\"", library));
                }
                Ok(outcome) => {
                    result.suggestions.push(format!(
                        "Install library \"{}\" manually: {}",
                        library,
                        outcome.error_text().unwrap_or_default()
                    ));
                    result.requires_manual_intervention = true;
                }
                Err(err) => {
                    result
                        .suggestions
                        .push(format!("Install library \"{}\" manually: {}", library, err));
                    result.requires_manual_intervention = true;
                }
            }
        }
    }

    for (path, (text, changed)) in sources {
        if !changed {
            continue;
        }
        match std::fs::write(&path, text) {
            Ok(()) => {
                info!("patched includes in {}", path.display());
                result.modified_files.push(path);
            }
            Err(err) => {
                warn!("could not save {}: {}", path.display(), err);
                result
                    .suggestions
                    .push(format!("Save the include changes to {} by hand", path.display()));
                result.requires_manual_intervention = true;
            }
        }
    }

    result.success = !result.applied.is_empty();
    result
}

/// Numeric, component-wise comparison: `1.10.0` > `1.9.2`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split(['.', '-', '+'])
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parts(a), parts(b));
    for idx in 0..left.len().max(right.len()) {
        let ordering = left
            .get(idx)
            .copied()
            .unwrap_or(0)
            .cmp(&right.get(idx).copied().unwrap_or(0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Keeps the newest version of every library installed more than once and
/// uninstalls the others as `name@version`.
pub fn fix_library_collision(toolchain: &dyn Toolchain) -> FixResult {
    let mut result = FixResult::default();
    let libraries = match toolchain.lib_list() {
        Ok(libraries) => libraries,
        Err(err) => {
            result
                .suggestions
                .push(format!("Could not list installed libraries: {}", err));
            result.requires_manual_intervention = true;
            return result;
        }
    };

    let mut by_name: BTreeMap<String, Vec<InstalledLibrary>> = BTreeMap::new();
    for library in libraries {
        by_name.entry(library.name.clone()).or_default().push(library);
    }

    for (name, mut versions) in by_name {
        if versions.len() < 2 {
            continue;
        }
        versions.sort_by(|a, b| compare_versions(&b.version, &a.version));
        let keep = versions.remove(0);
        for extra in versions {
            if compare_versions(&extra.version, &keep.version) == Ordering::Equal {
                result.suggestions.push(format!(
                    "\"{}\" {} is installed twice ({}); remove one copy",
                    name,
                    keep.version,
                    extra.location.as_deref().unwrap_or("unknown location")
                ));
                continue;
            }
            let target = format!("{}@{}", name, extra.version);
            match toolchain.lib_uninstall(&target) {
                Ok(outcome) if outcome.success() => result.applied.push(format!(
                    "Removed {} (kept {})",
                    target, keep.version
                )),
                Ok(outcome) => {
                    result.suggestions.push(format!(
                        "Uninstall {} manually: {}",
                        target,
                        outcome.error_text().unwrap_or_default()
                    ));
                    result.requires_manual_intervention = true;
                }
                Err(err) => {
                    result
                        .suggestions
                        .push(format!("Uninstall {} manually: {}", target, err));
                    result.requires_manual_intervention = true;
                }
            }
        }
    }

    result.success = !result.applied.is_empty();
    result
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchEdit {
    Replace { index: usize, text: String },
    InsertBefore { index: usize, text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxPatch {
    pub description: String,
    /// 1-based line the patch touches.
    pub line: usize,
    pub confidence: f32,
    pub edit: PatchEdit,
}

fn ends_statement(line: &str) -> bool {
    let code = strip_comment(line).trim_end();
    code.is_empty()
        || code.starts_with('#')
        || code.ends_with(';')
        || code.ends_with('{')
        || code.ends_with('}')
        || code.ends_with(',')
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn add_semicolon(line: &str) -> String {
    match line.find("//") {
        Some(idx) => {
            let (code, comment) = line.split_at(idx);
            format!("{}; {}", code.trim_end(), comment)
        }
        None => format!("{};", line.trim_end()),
    }
}

fn semicolon_patch(lines: &[String], diagnostic: &Diagnostic) -> Option<SyntaxPatch> {
    let reported = (diagnostic.line as usize).checked_sub(1)?;
    let index = if reported < lines.len() && !ends_statement(&lines[reported]) {
        reported
    } else {
        (0..reported.min(lines.len()))
            .rev()
            .find(|&idx| !lines[idx].trim().is_empty())?
    };
    if ends_statement(&lines[index]) {
        return None;
    }
    let confidence = if lines[index].contains("//") { 0.85 } else { 0.9 };
    Some(SyntaxPatch {
        description: "Add missing ';'".to_string(),
        line: index + 1,
        confidence,
        edit: PatchEdit::Replace {
            index,
            text: add_semicolon(&lines[index]),
        },
    })
}

fn paren_patch(lines: &[String], diagnostic: &Diagnostic) -> Option<SyntaxPatch> {
    let index = (diagnostic.line as usize).checked_sub(1)?;
    let line = lines.get(index)?;
    let code = strip_comment(line);
    let open = code.matches('(').count();
    let close = code.matches(')').count();
    if open <= close {
        return None;
    }
    let missing = ")".repeat(open - close);
    let trimmed = code.trim_end();
    let fixed_code = match trimmed.strip_suffix(';') {
        Some(body) => format!("{}{};", body.trim_end(), missing),
        None => format!("{}{}", trimmed, missing),
    };
    let text = format!("{}{}", fixed_code, &line[code.len()..]);
    Some(SyntaxPatch {
        description: format!("Close {} unbalanced '('", open - close),
        line: index + 1,
        confidence: 0.8,
        edit: PatchEdit::Replace { index, text },
    })
}

fn declaration_patch(lines: &[String], diagnostic: &Diagnostic) -> Option<SyntaxPatch> {
    let identifier = undeclared_identifier(&diagnostic.message)?;
    if include_for(&identifier).is_some() {
        return None;
    }
    let first = identifier.chars().next()?;
    if !(first.is_ascii_lowercase() || first == '_') {
        return None;
    }
    let index = lines
        .iter()
        .rposition(|line| is_include(line))
        .map(|idx| idx + 1)
        .unwrap_or(0);
    Some(SyntaxPatch {
        description: format!("Declare 'int {};' at file scope", identifier),
        line: index + 1,
        confidence: 0.5,
        edit: PatchEdit::InsertBefore {
            index,
            text: format!("int {};", identifier),
        },
    })
}

/// Single-line patch candidates for one diagnostic, each with a confidence.
pub fn candidate_patches(lines: &[String], diagnostic: &Diagnostic) -> Vec<SyntaxPatch> {
    let message = diagnostic.message.as_str();
    let mut patches = Vec::new();
    if message.contains("expected ';'") || message.contains("expected ',' or ';'") {
        patches.extend(semicolon_patch(lines, diagnostic));
    }
    if message.contains("expected ')'") {
        patches.extend(paren_patch(lines, diagnostic));
    }
    if diagnostic.code == ErrorCode::Undeclared {
        patches.extend(declaration_patch(lines, diagnostic));
    }
    patches
}

fn same_file(file: &Path, reported: &str) -> bool {
    let reported = Path::new(reported);
    reported == file || reported.file_name() == file.file_name()
}

/// Applies patches whose confidence reaches `threshold` and saves the file;
/// weaker candidates are only reported as suggestions.
pub fn fix_syntax_patch(file: &Path, diagnostics: &[Diagnostic], threshold: f32) -> FixResult {
    let mut result = FixResult::default();
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            result
                .suggestions
                .push(format!("Could not read {}: {}", file.display(), err));
            result.requires_manual_intervention = true;
            return result;
        }
    };
    let eol = line_ending(&source);
    let trailing_newline = source.ends_with('\n');
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();

    let mut touched = HashSet::new();
    let mut inserts: Vec<(usize, String)> = Vec::new();
    for diagnostic in diagnostics
        .iter()
        .filter(|d| d.is_error() && same_file(file, &d.file))
    {
        for patch in candidate_patches(&lines, diagnostic) {
            let label = format!(
                "{} at line {} (confidence {:.2})",
                patch.description, patch.line, patch.confidence
            );
            if patch.confidence < threshold || !touched.insert(patch.line) {
                result.suggestions.push(label);
                continue;
            }
            match patch.edit {
                PatchEdit::Replace { index, text } => lines[index] = text,
                PatchEdit::InsertBefore { index, text } => inserts.push((index, text)),
            }
            result.applied.push(label);
        }
    }

    if result.applied.is_empty() {
        return result;
    }
    inserts.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, text) in inserts {
        lines.insert(index.min(lines.len()), text);
    }
    let mut updated = lines.join(eol);
    if trailing_newline {
        updated.push_str(eol);
    }
    match std::fs::write(file, updated) {
        Ok(()) => {
            info!("applied {} syntax patch(es) to {}", result.applied.len(), file.display());
            result.modified_files.push(file.to_path_buf());
            result.success = true;
        }
        Err(err) => {
            result
                .suggestions
                .push(format!("Could not save {}: {}", file.display(), err));
            result.requires_manual_intervention = true;
        }
    }
    result
}
