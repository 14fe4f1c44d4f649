//! Signature sidecars.
//!
//! A [`Signature`] drops a small JSON file next to the handler-written files
//! of a target directory, recording provenance: who wrote it, when, with
//! which engine version, and the content hashes of the files in place.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::error::HandlerError;

/// One entry of the sidecar: a literal, or a preset resolved at write time.
#[derive(Debug, Clone)]
pub enum SignatureItem {
    Text(String),
    /// `YYYYMMDD-HHMMSS` local time.
    DateTime,
    /// `YYYYMMDD` local date.
    Date,
    /// Login of the writing user, from the environment.
    User,
    /// Engine version.
    Version,
    /// Names of the files present in the directory.
    Files,
    /// blake3 hash per file in the directory.
    Hashes,
    /// The directory itself.
    Dirname,
}

impl SignatureItem {
    fn resolve(&self, dir: &Utf8Path) -> Value {
        match self {
            SignatureItem::Text(text) => json!(text),
            SignatureItem::DateTime => {
                json!(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string())
            }
            SignatureItem::Date => json!(chrono::Local::now().format("%Y%m%d").to_string()),
            SignatureItem::User => {
                json!(std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()))
            }
            SignatureItem::Version => json!(env!("CARGO_PKG_VERSION")),
            SignatureItem::Files => json!(list_files(dir)),
            SignatureItem::Hashes => {
                let mut hashes = Map::new();
                for name in list_files(dir) {
                    match blake3_hex(&dir.join(&name)) {
                        Ok(hash) => {
                            hashes.insert(name, json!(hash));
                        }
                        Err(e) => warn!("could not hash signature file {name}: {e}"),
                    }
                }
                Value::Object(hashes)
            }
            SignatureItem::Dirname => json!(dir.as_str()),
        }
    }
}

fn list_files(dir: &Utf8Path) -> Vec<String> {
    let Ok(entries) = dir.read_dir_utf8() else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string())
        .collect();
    names.sort();
    names
}

fn blake3_hex(path: &Utf8Path) -> std::io::Result<String> {
    Ok(blake3::Hasher::new()
        .update_mmap_rayon(path)?
        .finalize()
        .to_hex()
        .to_string())
}

/// Sidecar generator installed on a file-backed storage; invoked on every
/// write, into the staged target directory before it is renamed into place.
#[derive(Debug, Clone)]
pub struct Signature {
    filename: String,
    items: BTreeMap<String, SignatureItem>,
}

impl Signature {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, item: SignatureItem) -> Self {
        self.items.insert(key.into(), item);
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn write(&self, dir: &Utf8Path) -> Result<(), HandlerError> {
        let path = dir.join(&self.filename);
        let content: Map<String, Value> = self
            .items
            .iter()
            .map(|(key, item)| (key.clone(), item.resolve(dir)))
            .collect();
        let body = serde_json::to_vec_pretty(&Value::Object(content))
            .map_err(|e| HandlerError::Encode(path.clone(), e.to_string()))?;
        fs::write(&path, body).map_err(|e| HandlerError::FileWrite(path, e))
    }
}
