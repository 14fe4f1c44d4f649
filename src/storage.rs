//! Keyed storage of target values.
//!
//! A [`Storage`] wraps a [`Backend`] (an in-memory map, or the file tree of
//! [`FileDb`](crate::filedb::FileDb)) behind a lock and layers the engine's
//! write discipline on top: write modes, per-name locks, comparators for
//! upgrade/test writes, lifecycle callbacks and temp-storage cleanup.
//!
//! Callbacks are invoked after the backend lock is released, so a callback
//! may freely re-enter the storage API.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PathError, StorageError};
use crate::target::Target;
use crate::task::{Status, Task};

/// Write discipline for an existing target; `None` (unset) refuses to
/// replace anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace unconditionally.
    Overwrite,
    /// Compare with the stored value; replace only when different.
    Upgrade,
    /// Compare with the stored value; never mutate.
    Test,
}

/// Custom equality for upgrade/test writes, registered per target name.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

type WriteCallback = Arc<dyn Fn(&Target, &Value) + Send + Sync>;
type TargetCallback = Arc<dyn Fn(&Target) + Send + Sync>;
type TestCallback = Arc<dyn Fn(&Target, bool) + Send + Sync>;

/// Raw keyed store underneath a [`Storage`]. Mode handling, locks and
/// callbacks live above; a backend only stores, fetches and enumerates.
pub trait Backend: Send {
    fn contains(&self, target: &Target) -> bool;

    fn get(&self, target: &Target) -> Result<Option<Value>, StorageError>;

    /// Store the value, replacing any previous one.
    fn put(&mut self, target: &Target, value: &Value) -> Result<(), StorageError>;

    /// Remove the value; `false` when nothing was stored.
    fn delete(&mut self, target: &Target) -> Result<bool, StorageError>;

    /// Every stored target this backend can round-trip, plus the keys it
    /// holds but cannot parse.
    fn list(&self) -> (Vec<Target>, Vec<Utf8PathBuf>);

    /// Physical location of the target, for backends that have one.
    fn location(&self, target: &Target) -> Option<Utf8PathBuf>;

    /// Verify the target is representable by this backend.
    fn check(&self, target: &Target) -> Result<(), PathError>;

    fn describe(&self) -> String;
}

/// Plain in-process backend over an ordered map.
#[derive(Default)]
pub struct MemoryBackend {
    map: std::collections::BTreeMap<Target, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn contains(&self, target: &Target) -> bool {
        self.map.contains_key(target)
    }

    fn get(&self, target: &Target) -> Result<Option<Value>, StorageError> {
        Ok(self.map.get(target).cloned())
    }

    fn put(&mut self, target: &Target, value: &Value) -> Result<(), StorageError> {
        self.map.insert(target.clone(), value.clone());
        Ok(())
    }

    fn delete(&mut self, target: &Target) -> Result<bool, StorageError> {
        Ok(self.map.remove(target).is_some())
    }

    fn list(&self) -> (Vec<Target>, Vec<Utf8PathBuf>) {
        (self.map.keys().cloned().collect(), Vec::new())
    }

    fn location(&self, _target: &Target) -> Option<Utf8PathBuf> {
        None
    }

    fn check(&self, _target: &Target) -> Result<(), PathError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct Storage {
    name: String,
    temporary: bool,
    backend: Mutex<Box<dyn Backend>>,
    locks: HashSet<String>,
    comparators: HashMap<String, Comparator>,
    on_read: Option<TargetCallback>,
    on_write: Option<WriteCallback>,
    on_del: Option<TargetCallback>,
    on_test: Option<TestCallback>,
}

impl Storage {
    pub fn new(backend: impl Backend + 'static) -> Self {
        let name = backend.describe();
        Self {
            name,
            temporary: false,
            backend: Mutex::new(Box::new(backend)),
            locks: HashSet::new(),
            comparators: HashMap::new(),
            on_read: None,
            on_write: None,
            on_del: None,
            on_test: None,
        }
    }

    /// In-memory storage.
    pub fn memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Temporary storages are cleaned up when the factory drains.
    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// Lock a target name: writes and removals of that name are refused.
    pub fn with_lock(mut self, name: impl Into<String>) -> Self {
        self.locks.insert(name.into());
        self
    }

    pub fn with_comparator(mut self, name: impl Into<String>, comparator: Comparator) -> Self {
        self.comparators.insert(name.into(), comparator);
        self
    }

    pub fn on_read(mut self, callback: impl Fn(&Target) + Send + Sync + 'static) -> Self {
        self.on_read = Some(Arc::new(callback));
        self
    }

    pub fn on_write(mut self, callback: impl Fn(&Target, &Value) + Send + Sync + 'static) -> Self {
        self.on_write = Some(Arc::new(callback));
        self
    }

    pub fn on_del(mut self, callback: impl Fn(&Target) + Send + Sync + 'static) -> Self {
        self.on_del = Some(Arc::new(callback));
        self
    }

    pub fn on_test(mut self, callback: impl Fn(&Target, bool) + Send + Sync + 'static) -> Self {
        self.on_test = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temporary(&self) -> bool {
        self.temporary
    }

    pub fn exists(&self, target: &Target) -> bool {
        self.backend.lock().unwrap().contains(target)
    }

    /// A target is locked when it exists and its name is in the lock set.
    pub fn locked(&self, target: &Target) -> bool {
        self.exists(target) && self.locks.contains(target.name())
    }

    /// Verify the target is representable by the backend.
    pub fn check(&self, target: &Target) -> Result<(), StorageError> {
        self.backend
            .lock()
            .unwrap()
            .check(target)
            .map_err(|source| StorageError::InvalidTarget {
                target: target.to_string(),
                source,
            })
    }

    pub fn read(&self, target: &Target) -> Result<Value, StorageError> {
        if let Some(callback) = &self.on_read {
            callback(target);
        }
        debug!(storage = %self.name, "reading target {target}");
        self.backend
            .lock()
            .unwrap()
            .get(target)?
            .ok_or_else(|| StorageError::DoesNotExist(target.to_string()))
    }

    pub fn write(
        &self,
        target: &Target,
        data: &Value,
        mode: Option<WriteMode>,
    ) -> Result<(), StorageError> {
        let mut test_outcome = None;
        {
            let mut backend = self.backend.lock().unwrap();
            if mode == Some(WriteMode::Test) && !backend.contains(target) {
                drop(backend);
                if let Some(callback) = &self.on_test {
                    callback(target, false);
                }
                return Ok(());
            }
            if let Some(previous) = backend.get(target)? {
                if self.locks.contains(target.name()) {
                    return Err(StorageError::Locked(target.name().to_string()));
                }
                match mode {
                    Some(WriteMode::Upgrade) | Some(WriteMode::Test) => {
                        let same = match self.comparators.get(target.name()) {
                            Some(comparator) => comparator(&previous, data),
                            None => previous == *data,
                        };
                        info!(storage = %self.name, "target {target} comparison was: {same}");
                        test_outcome = Some(same);
                        if same || mode == Some(WriteMode::Test) {
                            // nothing to replace
                            drop(backend);
                            if let Some(callback) = &self.on_test {
                                if let Some(same) = test_outcome {
                                    callback(target, same);
                                }
                            }
                            return Ok(());
                        }
                    }
                    Some(WriteMode::Overwrite) => {}
                    None => {
                        return Err(StorageError::AlreadyExists(target.to_string()));
                    }
                }
            }

            info!(storage = %self.name, "writing target {target}");
            backend.put(target, data)?;
        }

        if let Some(callback) = &self.on_test {
            if let Some(same) = test_outcome {
                callback(target, same);
            }
        }
        if let Some(callback) = &self.on_write {
            callback(target, data);
        }
        Ok(())
    }

    pub fn remove(&self, target: &Target) -> Result<(), StorageError> {
        if self.locks.contains(target.name()) {
            return Err(StorageError::Locked(target.name().to_string()));
        }
        let removed = {
            let mut backend = self.backend.lock().unwrap();
            info!(storage = %self.name, "removing target {target}");
            backend.delete(target)?
        };
        if !removed {
            return Err(StorageError::DoesNotExist(target.to_string()));
        }
        if let Some(callback) = &self.on_del {
            callback(target);
        }
        Ok(())
    }

    pub fn copy(&self, source: &Target, dest: &Target) -> Result<(), StorageError> {
        if !self.exists(source) {
            return Err(StorageError::DoesNotExist(source.to_string()));
        }
        if self.exists(dest) {
            return Err(StorageError::AlreadyExists(dest.to_string()));
        }
        let value = self.read(source)?;
        self.write(dest, &value, None)
    }

    /// Every target currently persisted (parseable keys only).
    pub fn list(&self) -> Vec<Target> {
        self.backend.lock().unwrap().list().0
    }

    /// Keys held by the backend that do not round-trip into targets.
    pub fn failed(&self) -> Vec<Utf8PathBuf> {
        self.backend.lock().unwrap().list().1
    }

    pub fn location(&self, target: &Target) -> Option<Utf8PathBuf> {
        self.backend.lock().unwrap().location(target)
    }

    /// Remove everything, returning the removed targets. Locked names make
    /// this fail part-way.
    pub fn clear(&self) -> Result<Vec<Target>, StorageError> {
        info!(storage = %self.name, "clearing storage");
        let targets = self.list();
        for target in &targets {
            self.remove(target)?;
        }
        Ok(targets)
    }

    /// Drop the input targets of finished tasks from a temporary storage.
    ///
    /// Inputs of tasks that ended in `Error` are kept so the failure can be
    /// inspected; everything consumed by `Success`/`Skipped`/`Rejected`
    /// tasks is removed. Storages not flagged temporary ignore the call.
    pub fn cleanup(&self, summary: &[Arc<Task>]) {
        if !self.temporary {
            return;
        }

        let mut all: HashSet<Target> = HashSet::new();
        let mut keep: HashSet<Target> = HashSet::new();
        for task in summary {
            let status = task.status();
            if !matches!(
                status,
                Status::Error | Status::Rejected | Status::Success | Status::Skipped
            ) {
                continue;
            }
            let targets: Vec<Target> = task
                .input_targets_flat()
                .into_iter()
                .filter(|target| self.exists(target))
                .collect();
            if targets.is_empty() {
                continue;
            }
            if status == Status::Error {
                keep.extend(targets.iter().cloned());
            }
            all.extend(targets);
        }

        let remove: Vec<&Target> = all.difference(&keep).collect();
        let nremove = remove.len();
        for target in remove {
            if let Err(e) = self.remove(target) {
                debug!("cleanup could not remove {target}: {e}");
            }
        }
        info!(
            storage = %self.name,
            "storage cleaned up, removed: {nremove}, kept: {}",
            keep.len()
        );
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage({})", self.name)
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage({})", self.name)
    }
}
