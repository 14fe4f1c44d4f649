//! File handlers: the codecs between stored values and target directories.
//!
//! A handler owns the layout of one target directory. The storage hands it
//! the [`Target`] and the directory; what files it writes there is its own
//! business. Handlers compose: [`KeyedHandler`] routes the fields of an
//! object value to named sub-handlers, [`ChainedHandler`] applies a sequence
//! of handlers to the same directory and unions their results on load.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use camino::Utf8Path;
use serde_json::Value;

use crate::error::HandlerError;
use crate::target::Target;

pub trait FileHandler: Send + Sync {
    fn save(&self, target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError>;

    fn load(&self, target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError>;
}

/// Default binary codec: the whole value as CBOR in a single `data.cbor`.
pub struct CborHandler {
    filename: String,
}

impl CborHandler {
    pub fn new() -> Self {
        Self {
            filename: "data.cbor".to_string(),
        }
    }

    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl Default for CborHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandler for CborHandler {
    fn save(&self, _target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError> {
        let path = dir.join(&self.filename);
        let file = File::create(&path).map_err(|e| HandlerError::FileWrite(path.clone(), e))?;
        ciborium::into_writer(value, BufWriter::new(file))
            .map_err(|e| HandlerError::Encode(path, e.to_string()))
    }

    fn load(&self, _target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError> {
        let path = dir.join(&self.filename);
        let file = File::open(&path).map_err(|e| HandlerError::FileRead(path.clone(), e))?;
        ciborium::from_reader(BufReader::new(file))
            .map_err(|e| HandlerError::Decode(path, e.to_string()))
    }
}

/// Human-readable codec: the whole value as pretty JSON in `data.json`.
pub struct JsonHandler {
    filename: String,
}

impl JsonHandler {
    pub fn new() -> Self {
        Self {
            filename: "data.json".to_string(),
        }
    }

    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl Default for JsonHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandler for JsonHandler {
    fn save(&self, _target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError> {
        let path = dir.join(&self.filename);
        let file = File::create(&path).map_err(|e| HandlerError::FileWrite(path.clone(), e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), value)
            .map_err(|e| HandlerError::Encode(path, e.to_string()))
    }

    fn load(&self, _target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError> {
        let path = dir.join(&self.filename);
        let file = File::open(&path).map_err(|e| HandlerError::FileRead(path.clone(), e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| HandlerError::Decode(path, e.to_string()))
    }
}

type SaveFn = dyn Fn(&Target, &Utf8Path, &Value) -> Result<(), HandlerError> + Send + Sync;
type LoadFn = dyn Fn(&Target, &Utf8Path) -> Result<Value, HandlerError> + Send + Sync;

/// Handler built from a plain `(save, load)` pair of closures.
pub struct PairHandler {
    save: Arc<SaveFn>,
    load: Arc<LoadFn>,
}

impl PairHandler {
    pub fn new<S, L>(save: S, load: L) -> Self
    where
        S: Fn(&Target, &Utf8Path, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
        L: Fn(&Target, &Utf8Path) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            save: Arc::new(save),
            load: Arc::new(load),
        }
    }
}

impl FileHandler for PairHandler {
    fn save(&self, target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError> {
        (self.save)(target, dir, value)
    }

    fn load(&self, target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError> {
        (self.load)(target, dir)
    }
}

/// Routes the fields of an object value to named sub-handlers.
///
/// On save, each registered key picks its field out of the object (fields
/// without a handler are skipped); on load the object is rebuilt from every
/// registered key.
pub struct KeyedHandler {
    parts: BTreeMap<String, Arc<dyn FileHandler>>,
}

impl KeyedHandler {
    pub fn new() -> Self {
        Self {
            parts: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, handler: Arc<dyn FileHandler>) -> Self {
        self.parts.insert(key.into(), handler);
        self
    }
}

impl Default for KeyedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandler for KeyedHandler {
    fn save(&self, target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError> {
        let Value::Object(map) = value else {
            let key = self.parts.keys().next().cloned().unwrap_or_default();
            return Err(HandlerError::NotAnObject(key));
        };
        for (key, handler) in &self.parts {
            if let Some(field) = map.get(key) {
                handler.save(target, dir, field)?;
            }
        }
        Ok(())
    }

    fn load(&self, target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError> {
        let mut map = serde_json::Map::new();
        for (key, handler) in &self.parts {
            map.insert(key.clone(), handler.load(target, dir)?);
        }
        Ok(Value::Object(map))
    }
}

/// Applies each handler in order on save; on load, unions the object results
/// of every handler into one value.
pub struct ChainedHandler {
    handlers: Vec<Arc<dyn FileHandler>>,
}

impl ChainedHandler {
    pub fn new(handlers: Vec<Arc<dyn FileHandler>>) -> Self {
        Self { handlers }
    }
}

impl FileHandler for ChainedHandler {
    fn save(&self, target: &Target, dir: &Utf8Path, value: &Value) -> Result<(), HandlerError> {
        if !value.is_object() {
            return Err(HandlerError::ChainValue);
        }
        for handler in &self.handlers {
            handler.save(target, dir, value)?;
        }
        Ok(())
    }

    fn load(&self, target: &Target, dir: &Utf8Path) -> Result<Value, HandlerError> {
        let mut map = serde_json::Map::new();
        for handler in &self.handlers {
            match handler.load(target, dir)? {
                Value::Object(part) => map.extend(part),
                _ => return Err(HandlerError::ChainValue),
            }
        }
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Branch, Index};
    use serde_json::json;

    fn target() -> Target {
        Target::new("A", Index::atom("1").unwrap(), Branch::empty()).unwrap()
    }

    fn tempdir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_cbor_roundtrip() {
        let (_dir, path) = tempdir();
        let handler = CborHandler::new();
        let value = json!({"a": 1, "b": [1, 2, 3]});
        handler.save(&target(), &path, &value).unwrap();
        assert_eq!(handler.load(&target(), &path).unwrap(), value);
    }

    #[test]
    fn test_json_roundtrip() {
        let (_dir, path) = tempdir();
        let handler = JsonHandler::new();
        let value = json!("foobar");
        handler.save(&target(), &path, &value).unwrap();
        assert_eq!(handler.load(&target(), &path).unwrap(), value);
        assert!(path.join("data.json").is_file());
    }

    #[test]
    fn test_load_missing() {
        let (_dir, path) = tempdir();
        let handler = CborHandler::new();
        assert!(matches!(
            handler.load(&target(), &path),
            Err(HandlerError::FileRead(..))
        ));
    }

    #[test]
    fn test_keyed_handler() {
        let (_dir, path) = tempdir();
        let handler = KeyedHandler::new()
            .with("meta", Arc::new(JsonHandler::named("meta.json")))
            .with("body", Arc::new(CborHandler::named("body.cbor")));

        let value = json!({"meta": {"k": 1}, "body": "text", "ignored": true});
        handler.save(&target(), &path, &value).unwrap();
        assert!(path.join("meta.json").is_file());
        assert!(path.join("body.cbor").is_file());

        let back = handler.load(&target(), &path).unwrap();
        assert_eq!(back, json!({"meta": {"k": 1}, "body": "text"}));

        assert!(handler.save(&target(), &path, &json!(1)).is_err());
    }

    #[test]
    fn test_chained_handler() {
        let (_dir, path) = tempdir();
        let first = Arc::new(KeyedHandler::new().with("a", Arc::new(JsonHandler::named("a.json"))));
        let second = Arc::new(KeyedHandler::new().with("b", Arc::new(JsonHandler::named("b.json"))));
        let chain = ChainedHandler::new(vec![first, second]);

        let value = json!({"a": 1, "b": 2});
        chain.save(&target(), &path, &value).unwrap();
        assert_eq!(chain.load(&target(), &path).unwrap(), value);
    }

    #[test]
    fn test_pair_handler() {
        let (_dir, path) = tempdir();
        let handler = PairHandler::new(
            |_t, dir, value| {
                let path = dir.join("raw.txt");
                let text = value.as_str().unwrap_or_default();
                std::fs::write(&path, text).map_err(|e| HandlerError::FileWrite(path, e))
            },
            |_t, dir| {
                let path = dir.join("raw.txt");
                let text =
                    std::fs::read_to_string(&path).map_err(|e| HandlerError::FileRead(path, e))?;
                Ok(Value::String(text))
            },
        );

        handler.save(&target(), &path, &json!("payload")).unwrap();
        assert_eq!(handler.load(&target(), &path).unwrap(), json!("payload"));
    }
}
