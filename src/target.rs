//! Targets and i/o slot declarations.
//!
//! A [`TargetType`] is the declarative side: one input or output slot of a
//! machine, known before any identifier is bound. A [`Target`] is the
//! concrete handle derived from it: a storage name plus an identifier, and
//! the only kind of key a [`Storage`](crate::storage::Storage) understands.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde_json::{Value, json};

use crate::error::{IdentifierError, TargetError};
use crate::handlers::FileHandler;
use crate::identifier::{Branch, Identifier, Index};

/// Target names additionally allow `+` and `-` on top of word characters.
static RE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w+\-]+$").expect("name regex"));

/// Slot destinations are storage key names: word characters only.
static RE_DEST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").expect("dest regex"));

/// Destination of an i/o slot: a storage name, or unresolved until a
/// variable-i/o parameter supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IoDest {
    Name(String),
    Virtual,
}

/// One declared input or output slot of a machine.
///
/// Equality and hashing consider the destination only: two slots naming the
/// same storage key are the same slot, whatever their handler or type tag.
#[derive(Clone)]
pub struct TargetType {
    dest: IoDest,
    ty: Option<String>,
    handler: Option<Arc<dyn FileHandler>>,
    temp: bool,
}

impl TargetType {
    pub fn new(dest: impl Into<String>) -> Result<Self, TargetError> {
        let dest = dest.into();
        if !RE_DEST.is_match(&dest) {
            return Err(TargetError::Dest(dest));
        }
        Ok(Self {
            dest: IoDest::Name(dest),
            ty: None,
            handler: None,
            temp: false,
        })
    }

    /// Slot whose destination is late-bound by a variable-i/o parameter.
    pub fn virtual_slot() -> Self {
        Self {
            dest: IoDest::Virtual,
            ty: None,
            handler: None,
            temp: false,
        }
    }

    /// Parse the compact slot grammar `name[:type[:dest]]`, returning the
    /// slot name and the declared type. An omitted destination defaults to
    /// the name; empty fields are skipped (`A::D` sets only the destination).
    pub fn parse(expr: &str) -> Result<(String, Self), TargetError> {
        let mut parts = expr.splitn(3, ':');
        let name = parts.next().unwrap_or("").trim().to_string();
        let ty = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let dest = parts.next().map(str::trim).filter(|s| !s.is_empty());

        let mut slot = Self::new(dest.unwrap_or(name.as_str()))?;
        if let Some(ty) = ty {
            slot = slot.with_type(ty);
        }
        Ok((name, slot))
    }

    pub fn with_type(mut self, ty: impl Into<String>) -> Self {
        self.ty = Some(ty.into());
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_temp(mut self, temp: bool) -> Self {
        self.temp = temp;
        self
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.dest, IoDest::Virtual)
    }

    pub fn is_temp(&self) -> bool {
        self.temp
    }

    /// Destination name, if bound.
    pub fn dest(&self) -> Option<&str> {
        match &self.dest {
            IoDest::Name(name) => Some(name),
            IoDest::Virtual => None,
        }
    }

    pub fn ty(&self) -> Option<&str> {
        self.ty.as_deref()
    }

    pub fn handler(&self) -> Option<&Arc<dyn FileHandler>> {
        self.handler.as_ref()
    }

    /// Bind an identifier, producing the concrete target.
    pub fn target(&self, index: Index, branch: Branch) -> Result<Target, TargetError> {
        let IoDest::Name(name) = &self.dest else {
            return Err(TargetError::Virtual);
        };
        let mut target = Target::new(name.clone(), index, branch)?;
        target.ty = self.ty.clone();
        target.handler = self.handler.clone();
        target.temp = self.temp;
        Ok(target)
    }

    pub fn targets(&self, identifiers: &[Identifier]) -> Result<Vec<Target>, TargetError> {
        identifiers
            .iter()
            .map(|id| self.target(id.index.clone(), id.branch.clone()))
            .collect()
    }
}

impl PartialEq for TargetType {
    fn eq(&self, other: &Self) -> bool {
        self.dest == other.dest
    }
}

impl Eq for TargetType {}

impl Hash for TargetType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dest.hash(state);
    }
}

impl fmt::Debug for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetType")
            .field("dest", &self.dest)
            .field("ty", &self.ty)
            .field("handler", &self.handler.as_ref().map(|_| "*"))
            .field("temp", &self.temp)
            .finish()
    }
}

/// Open key-value map attached to a target at runtime, shared between every
/// clone of the handle. Mutation happens under the map's own lock.
type Attachment = Arc<Mutex<BTreeMap<String, Value>>>;

/// Concrete handle for one stored value.
///
/// Identity is the triple `(index, name, branch)`, compared in that order so
/// that targets sort by identifier first.
#[derive(Clone)]
pub struct Target {
    name: String,
    index: Index,
    branch: Branch,
    ty: Option<String>,
    handler: Option<Arc<dyn FileHandler>>,
    temp: bool,
    attachment: Attachment,
}

impl Target {
    pub fn new(
        name: impl Into<String>,
        index: Index,
        branch: Branch,
    ) -> Result<Self, TargetError> {
        let name = name.into();
        if !RE_NAME.is_match(&name) {
            return Err(TargetError::Name(name));
        }
        Ok(Self {
            name,
            index,
            branch,
            ty: None,
            handler: None,
            temp: false,
            attachment: Arc::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn identifier(&self) -> Identifier {
        Identifier::new(self.index.clone(), self.branch.clone())
    }

    pub fn ty(&self) -> Option<&str> {
        self.ty.as_deref()
    }

    pub fn handler(&self) -> Option<&Arc<dyn FileHandler>> {
        self.handler.as_ref()
    }

    /// Targets flagged temporary live in the temp storage and are removed
    /// once the tasks consuming them finish.
    pub fn is_temp(&self) -> bool {
        self.temp
    }

    pub fn set_temp(&mut self, temp: bool) {
        self.temp = temp;
    }

    /// Attach a value under `key`. Existing keys are refused unless
    /// `overwrite` is set.
    pub fn attach(
        &self,
        key: impl Into<String>,
        value: Value,
        overwrite: bool,
    ) -> Result<(), TargetError> {
        let key = key.into();
        let mut map = self.attachment.lock().unwrap();
        if !overwrite && map.contains_key(&key) {
            return Err(TargetError::AttachmentKey(key));
        }
        map.insert(key, value);
        Ok(())
    }

    /// Snapshot of the attachment map.
    pub fn attachment(&self) -> BTreeMap<String, Value> {
        self.attachment.lock().unwrap().clone()
    }

    /// Wildcard match on all three coordinates. `None` patterns for index or
    /// branch match only the empty value; `*` matches anything.
    pub fn matches(&self, name: &str, index: Option<&str>, branch: Option<&str>) -> bool {
        let name_ok = if name.contains('*') {
            let expr = name
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            Regex::new(&format!("^{expr}$"))
                .map(|re| re.is_match(&self.name))
                .unwrap_or(false)
        } else {
            name == self.name
        };
        name_ok
            && self.index.matches(index.unwrap_or(""))
            && self.branch.matches(branch.unwrap_or(""))
    }

    /// Serializable `(name, index, branch)` record.
    pub fn serialize(&self) -> Value {
        json!({
            "name": self.name,
            "index": self.index,
            "branch": self.branch,
        })
    }

    pub fn deserialize(value: &Value) -> Result<Self, TargetError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TargetError::Name(value.to_string()))?;
        let index = parse_id_field(value.get("index"))?;
        let branch = parse_id_field(value.get("branch"))?;
        Self::new(name, Index::new(index)?, Branch::new(branch)?)
    }
}

fn parse_id_field(value: Option<&Value>) -> Result<Vec<String>, IdentifierError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(IdentifierError::InvalidAtom(other.to_string())),
            })
            .collect(),
        Some(other) => Err(IdentifierError::InvalidAtom(other.to_string())),
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        (&self.index, &self.name, &self.branch) == (&other.index, &other.name, &other.branch)
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (&self.index, &self.name, &self.branch).hash(state);
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.index, &self.name, &self.branch).cmp(&(&other.index, &other.name, &other.branch))
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `index#name~branch`; the trailing `~` marks the empty branch.
        if !self.index.is_empty() {
            write!(f, "{}", self.index)?;
        }
        write!(f, "#{}~", self.name)?;
        if !self.branch.is_empty() {
            write!(f, "{}", self.branch)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ix(atoms: &[&str]) -> Index {
        Index::new(atoms.iter().copied()).unwrap()
    }

    fn br(atoms: &[&str]) -> Branch {
        Branch::new(atoms.iter().copied()).unwrap()
    }

    #[test]
    fn test_target_names() {
        assert!(Target::new("so+me-na_me", Index::empty(), Branch::empty()).is_ok());
        assert!(Target::new("some.name", Index::empty(), Branch::empty()).is_err());
        assert!(Target::new("", Index::empty(), Branch::empty()).is_err());
    }

    #[test]
    fn test_target_identity() {
        let a = Target::new("A", ix(&["1"]), br(&["b"])).unwrap();
        let b = Target::new("A", ix(&["1"]), br(&["b"])).unwrap();
        let c = Target::new("A", ix(&["2"]), br(&["b"])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        // index dominates ordering
        let d = Target::new("Z", ix(&["1"]), Branch::empty()).unwrap();
        assert!(d < c);

        // null index sorts last
        let agg = Target::new("A", Index::empty(), Branch::empty()).unwrap();
        assert!(c < agg);
    }

    #[test]
    fn test_target_display() {
        let t = Target::new("A", ix(&["1", "2"]), br(&["x"])).unwrap();
        assert_eq!(t.to_string(), "1.2#A~x");
        let t = Target::new("A", Index::empty(), Branch::empty()).unwrap();
        assert_eq!(t.to_string(), "#A~");
    }

    #[test]
    fn test_attachment() {
        let t = Target::new("A", ix(&["1"]), Branch::empty()).unwrap();
        t.attach("key", json!(1), false).unwrap();
        assert!(t.attach("key", json!(2), false).is_err());
        t.attach("key", json!(2), true).unwrap();
        assert_eq!(t.attachment()["key"], json!(2));

        // clones share the attachment
        let u = t.clone();
        u.attach("other", json!("x"), false).unwrap();
        assert!(t.attachment().contains_key("other"));
    }

    #[test]
    fn test_target_type_parse() {
        let (name, slot) = TargetType::parse("A").unwrap();
        assert_eq!(name, "A");
        assert_eq!(slot.dest(), Some("A"));
        assert_eq!(slot.ty(), None);

        let (name, slot) = TargetType::parse("A:T").unwrap();
        assert_eq!(name, "A");
        assert_eq!(slot.ty(), Some("T"));

        let (name, slot) = TargetType::parse("A::D").unwrap();
        assert_eq!(name, "A");
        assert_eq!(slot.dest(), Some("D"));
        assert_eq!(slot.ty(), None);

        let (_, slot) = TargetType::parse("A:T:D").unwrap();
        assert_eq!(slot.dest(), Some("D"));
        assert_eq!(slot.ty(), Some("T"));

        assert!(TargetType::parse("A.B").is_err());
    }

    #[test]
    fn test_virtual_slot() {
        let slot = TargetType::virtual_slot();
        assert!(slot.is_virtual());
        assert!(slot.target(Index::empty(), Branch::empty()).is_err());
    }

    #[test]
    fn test_slot_equality_by_dest() {
        let a = TargetType::new("A").unwrap().with_type("T");
        let b = TargetType::new("A").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_target_matches() {
        let t = Target::new("output", ix(&["1", "2"]), br(&["b1"])).unwrap();
        assert!(t.matches("output", Some("1.2"), Some("b1")));
        assert!(t.matches("out*", Some("1.*"), Some("*")));
        assert!(!t.matches("output", Some("1"), Some("b1")));
        assert!(!t.matches("output", Some("1.2"), None));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let t = Target::new("A", ix(&["1", "2"]), br(&["b"])).unwrap();
        let value = t.serialize();
        let back = Target::deserialize(&value).unwrap();
        assert_eq!(back, t);
    }
}
