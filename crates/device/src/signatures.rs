use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const BUILTIN_TABLE: &str = include_str!("../data/signatures.json");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardSignature {
    pub fqbn: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManufacturerHint {
    pub needle: String,
    pub fqbn: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TableFile {
    signatures: HashMap<String, BoardSignature>,
    #[serde(default)]
    manufacturers: Vec<ManufacturerHint>,
}

/// vid:pid → board lookup plus the manufacturer-name fallback list.
#[derive(Debug, Clone, Default)]
pub struct SignatureTable {
    signatures: HashMap<String, BoardSignature>,
    manufacturers: Vec<ManufacturerHint>,
}

impl SignatureTable {
    pub fn builtin() -> Self {
        Self::from_json_str(BUILTIN_TABLE).unwrap_or_else(|err| {
            log::error!("builtin signature table is invalid: {}", err);
            Self::default()
        })
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let file: TableFile = serde_json::from_str(data)?;
        let signatures = file
            .signatures
            .into_iter()
            .map(|(key, value)| (key.trim().to_ascii_lowercase(), value))
            .collect();
        let manufacturers = file
            .manufacturers
            .into_iter()
            .map(|hint| ManufacturerHint {
                needle: hint.needle.to_ascii_lowercase(),
                ..hint
            })
            .collect();
        Ok(Self {
            signatures,
            manufacturers,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read signature table {}", path.display()))?;
        Self::from_json_str(&data).with_context(|| format!("parse {}", path.display()))
    }

    pub fn insert(&mut self, signature: &str, fqbn: &str, name: &str) {
        self.signatures.insert(
            signature.to_ascii_lowercase(),
            BoardSignature {
                fqbn: fqbn.to_string(),
                name: name.to_string(),
            },
        );
    }

    pub fn lookup(&self, signature: &str) -> Option<&BoardSignature> {
        self.signatures.get(&signature.to_ascii_lowercase())
    }

    pub fn match_manufacturer(&self, manufacturer: &str) -> Option<&ManufacturerHint> {
        let manufacturer = manufacturer.to_ascii_lowercase();
        self.manufacturers
            .iter()
            .find(|hint| manufacturer.contains(&hint.needle))
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
