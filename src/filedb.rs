//! File tree backend.
//!
//! One directory per target, addressed through a [`PathScheme`]; the files
//! inside are written by the resolved [`FileHandler`]. Writes are staged in
//! a fresh temporary directory under the storage root and renamed into
//! place, so a crash never leaves a half-populated target directory behind.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PathError, StorageError};
use crate::handlers::{CborHandler, FileHandler};
use crate::pathexpr::PathScheme;
use crate::signature::Signature;
use crate::storage::{Backend, Storage};
use crate::target::Target;

pub struct FileDb {
    root: Utf8PathBuf,
    scheme: PathScheme,
    handlers: HashMap<String, Arc<dyn FileHandler>>,
    default_handler: Arc<dyn FileHandler>,
    signature: Option<Signature>,
}

impl FileDb {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self {
            root,
            scheme: PathScheme::workdir(),
            handlers: HashMap::new(),
            default_handler: Arc::new(CborHandler::new()),
            signature: None,
        })
    }

    pub fn with_scheme(mut self, scheme: PathScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Register a handler under a target name or a target type tag.
    pub fn with_handler(mut self, key: impl Into<String>, handler: Arc<dyn FileHandler>) -> Self {
        self.handlers.insert(key.into(), handler);
        self
    }

    pub fn with_default_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.default_handler = handler;
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Wrap into a [`Storage`] named after the root directory.
    pub fn into_storage(self) -> Storage {
        let name = self.root.as_str().to_string();
        Storage::new(self).with_name(name)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resolution order: target handler, then by name, then by type tag,
    /// then the default.
    fn handler_for(&self, target: &Target) -> Arc<dyn FileHandler> {
        if let Some(handler) = target.handler() {
            return handler.clone();
        }
        if let Some(handler) = self.handlers.get(target.name()) {
            return handler.clone();
        }
        if let Some(handler) = target.ty().and_then(|ty| self.handlers.get(ty)) {
            return handler.clone();
        }
        self.default_handler.clone()
    }

    fn path_for(&self, target: &Target) -> Result<Utf8PathBuf, StorageError> {
        let rel = self
            .scheme
            .to_path(target)
            .map_err(|source| StorageError::InvalidTarget {
                target: target.to_string(),
                source,
            })?;
        Ok(self.root.join(rel))
    }

    fn io_error(path: &Utf8Path) -> impl Fn(std::io::Error) -> StorageError + '_ {
        move |e| StorageError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }

    /// Remove emptied directories from `path` up toward the root.
    fn prune_upward(&self, path: &Utf8Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if !dir.starts_with(&self.root) || dir == self.root {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                // non-empty or already gone
                break;
            }
            current = dir.parent();
        }
    }

    /// Collect leaf directories: no visible subdirectory and at least one
    /// visible file. Dot-entries (staging dirs, sidecars kept hidden) are
    /// ignored.
    fn leaf_dirs(&self, dir: &Utf8Path, leaves: &mut Vec<Utf8PathBuf>) {
        let Ok(entries) = dir.read_dir_utf8() else {
            return;
        };
        let mut subdirs = Vec::new();
        let mut has_file = false;
        for entry in entries.flatten() {
            if entry.file_name().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(path.to_path_buf());
            } else {
                has_file = true;
            }
        }
        if subdirs.is_empty() && has_file && dir != self.root {
            leaves.push(dir.to_path_buf());
        }
        for subdir in subdirs {
            self.leaf_dirs(&subdir, leaves);
        }
    }
}

impl Backend for FileDb {
    fn contains(&self, target: &Target) -> bool {
        match self.path_for(target) {
            Ok(path) => path.exists(),
            Err(_) => false,
        }
    }

    fn get(&self, target: &Target) -> Result<Option<Value>, StorageError> {
        let path = self.path_for(target)?;
        if !path.exists() {
            return Ok(None);
        }
        let value = self.handler_for(target).load(target, &path)?;
        Ok(Some(value))
    }

    fn put(&mut self, target: &Target, value: &Value) -> Result<(), StorageError> {
        let dest = self.path_for(target)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(Self::io_error(parent))?;
        }

        // stage in a fresh directory under the root, then swap it in
        let stage = tempfile::Builder::new()
            .prefix(".stage-")
            .tempdir_in(&self.root)
            .map_err(Self::io_error(&self.root))?;
        let stage_path = Utf8Path::from_path(stage.path())
            .ok_or_else(|| StorageError::InvalidTarget {
                target: target.to_string(),
                source: PathError::Parse(stage.path().display().to_string()),
            })?
            .to_path_buf();

        self.handler_for(target).save(target, &stage_path, value)?;
        if let Some(signature) = &self.signature {
            signature.write(&stage_path)?;
        }

        let staged = stage.keep();
        if dest.exists() {
            // the previous directory is moved aside and removed only after
            // the new one is live
            let old = self.root.join(format!(".old-{}", Uuid::new_v4()));
            fs::rename(&dest, &old).map_err(Self::io_error(&dest))?;
            fs::rename(&staged, &dest).map_err(Self::io_error(&dest))?;
            fs::remove_dir_all(&old).map_err(Self::io_error(&dest))?;
        } else {
            fs::rename(&staged, &dest).map_err(Self::io_error(&dest))?;
        }
        Ok(())
    }

    fn delete(&mut self, target: &Target) -> Result<bool, StorageError> {
        let path = self.path_for(target)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path).map_err(Self::io_error(&path))?;
        self.prune_upward(&path);
        Ok(true)
    }

    fn list(&self) -> (Vec<Target>, Vec<Utf8PathBuf>) {
        let mut leaves = Vec::new();
        self.leaf_dirs(&self.root, &mut leaves);

        let parsed: Vec<(Utf8PathBuf, Result<Target, PathError>)> = leaves
            .into_par_iter()
            .map(|leaf| {
                let rel = leaf.strip_prefix(&self.root).unwrap_or(&leaf).to_path_buf();
                let target = self.scheme.from_path(&rel);
                (leaf, target)
            })
            .collect();

        let mut targets = Vec::new();
        let mut failed = Vec::new();
        for (leaf, result) in parsed {
            match result {
                Ok(target) => targets.push(target),
                Err(e) => {
                    debug!("skipping path {leaf}: {e}");
                    failed.push(leaf);
                }
            }
        }
        targets.sort();
        (targets, failed)
    }

    fn location(&self, target: &Target) -> Option<Utf8PathBuf> {
        self.path_for(target).ok()
    }

    fn check(&self, target: &Target) -> Result<(), PathError> {
        self.scheme.to_path(target).map(|_| ())
    }

    fn describe(&self) -> String {
        self.root.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Branch, Index};
    use crate::signature::SignatureItem;
    use crate::storage::WriteMode;
    use serde_json::json;

    fn target(name: &str, index: &[&str], branch: &[&str]) -> Target {
        Target::new(
            name,
            Index::new(index.iter().copied()).unwrap(),
            Branch::new(branch.iter().copied()).unwrap(),
        )
        .unwrap()
    }

    fn filedb() -> (tempfile::TempDir, FileDb) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        let db = FileDb::new(root).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, mut db) = filedb();
        let t = target("A", &["1", "2"], &["br"]);

        assert!(!db.contains(&t));
        db.put(&t, &json!({"k": "v"})).unwrap();
        assert!(db.contains(&t));
        assert_eq!(db.get(&t).unwrap().unwrap(), json!({"k": "v"}));

        // layout: <root>/1.2/A~br/data.cbor
        let dir = db.root().join("1.2").join("A~br");
        assert!(dir.join("data.cbor").is_file());

        assert!(db.delete(&t).unwrap());
        assert!(!db.contains(&t));
        // emptied index directory was pruned
        assert!(!db.root().join("1.2").exists());
        assert!(!db.delete(&t).unwrap());
    }

    #[test]
    fn test_no_staging_leftovers() {
        let (_dir, mut db) = filedb();
        db.put(&target("A", &["1"], &[]), &json!(1)).unwrap();
        db.put(&target("A", &["1"], &[]), &json!(2)).unwrap();

        let hidden: Vec<_> = db
            .root()
            .read_dir_utf8()
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
        assert_eq!(db.get(&target("A", &["1"], &[])).unwrap().unwrap(), json!(2));
    }

    #[test]
    fn test_list_and_failed() {
        let (_dir, mut db) = filedb();
        let a = target("A", &["1"], &[]);
        let b = target("B", &["2"], &["x"]);
        db.put(&a, &json!(1)).unwrap();
        db.put(&b, &json!(2)).unwrap();

        // drop an unparseable leaf into the tree
        let rogue = db.root().join("not a target");
        fs::create_dir_all(&rogue).unwrap();
        fs::write(rogue.join("file"), b"?").unwrap();

        let (targets, failed) = db.list();
        assert_eq!(targets, vec![a, b]);
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn test_dedicated_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
        let mut db = FileDb::new(root)
            .unwrap()
            .with_scheme(PathScheme::dedicated("A").unwrap());

        let t = target("A", &["id1", "id2"], &[]);
        db.put(&t, &json!("v")).unwrap();
        assert!(db.root().join("id1.id2").join("data.cbor").is_file());

        // foreign names are not representable
        let other = target("B", &["1"], &[]);
        assert!(matches!(
            db.put(&other, &json!(1)),
            Err(StorageError::InvalidTarget { .. })
        ));
        assert!(db.check(&other).is_err());
    }

    #[test]
    fn test_signature_sidecar() {
        let (_dir, mut db) = filedb();
        db = db.with_signature(
            Signature::new(".signature.json")
                .with("version", SignatureItem::Version)
                .with("hashes", SignatureItem::Hashes),
        );

        let t = target("A", &["1"], &[]);
        db.put(&t, &json!("payload")).unwrap();

        let sidecar = db.root().join("1").join("A").join(".signature.json");
        assert!(sidecar.is_file());
        let body: Value = serde_json::from_str(&fs::read_to_string(sidecar).unwrap()).unwrap();
        assert!(body["hashes"]["data.cbor"].is_string());
    }

    #[test]
    fn test_storage_over_filedb() {
        let (_dir, db) = filedb();
        let storage = db.into_storage();
        let t = target("A", &["1"], &[]);

        storage.write(&t, &json!("v"), None).unwrap();
        assert!(matches!(
            storage.write(&t, &json!("w"), None),
            Err(StorageError::AlreadyExists(_))
        ));
        storage
            .write(&t, &json!("w"), Some(WriteMode::Upgrade))
            .unwrap();
        assert_eq!(storage.read(&t).unwrap(), json!("w"));
        assert!(storage.location(&t).is_some());
    }
}
