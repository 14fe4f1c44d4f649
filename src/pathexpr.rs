//! Template-driven conversion between targets and relative paths.
//!
//! A [`PathScheme`] is configured with a layout template (`<index>/<name><branch>`)
//! and one sub-template per identifier (`<id>[.<id>]`). The bracketed part is
//! a *generative group*: it repeats once per extra atom, which is how a
//! single template covers identifiers of any arity. A sub-template without a
//! group is fixed-length and rejects every other arity.
//!
//! Conversion is bidirectional and self-checking: rendering verifies that
//! the path parses back to the same target, parsing verifies that the target
//! renders back to the same path.

use std::collections::HashMap;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

use crate::error::PathError;
use crate::identifier::{Branch, Index};
use crate::target::Target;

static RE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<(\w+)>").expect("regex"));
static RE_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("regex"));

/// Accepted values for one placeholder: a closed list, or a pattern the
/// value must match from its start.
pub enum ValueRule {
    OneOf(Vec<String>),
    Matches(Regex),
}

impl ValueRule {
    fn check(&self, name: &str, value: &str) -> Result<(), PathError> {
        let ok = match self {
            ValueRule::OneOf(list) => list.iter().any(|v| v == value),
            ValueRule::Matches(re) => re.find(value).is_some_and(|m| m.start() == 0),
        };
        if ok {
            Ok(())
        } else {
            Err(PathError::Value {
                name: name.to_string(),
                reason: value.to_string(),
            })
        }
    }
}

/// Atom punctuation admitted inside a placeholder, on top of alphanumerics.
const ID_CHARS: &[char] = &['+', '-', '_', ':', '(', ')'];

struct Segment {
    text: String,
    vals: Vec<String>,
}

struct GenSegment {
    text: String,
    val: String,
}

/// Sub-template converting one identifier (index or branch) to a path
/// fragment and back.
pub struct IdTemplate {
    expr: String,
    noid: String,
    prefix: String,
    suffix: String,
    head: Segment,
    r#gen: Option<GenSegment>,
    tail: Segment,
    idexpr: String,
    values: HashMap<String, ValueRule>,
}

impl IdTemplate {
    pub fn new(
        expr: &str,
        noid: &str,
        values: HashMap<String, ValueRule>,
    ) -> Result<Self, PathError> {
        if RE_PLACEHOLDER.find(expr).is_none() {
            return Err(PathError::MissingPlaceholder(expr.to_string()));
        }

        let prefix: String = expr.chars().take_while(|c| *c != '<' && *c != '[').collect();
        let suffix: String = {
            let rev: String = expr
                .chars()
                .rev()
                .take_while(|c| *c != '>' && *c != ']')
                .collect();
            rev.chars().rev().collect()
        };

        let mut idchars: Vec<char> = ID_CHARS.to_vec();
        let (head_text, r#gen, tail_text) = match RE_GROUP.captures(expr) {
            Some(caps) => {
                let whole = caps.get(0).expect("group 0");
                let inner = caps.get(1).expect("group 1").as_str();
                let head = &expr[..whole.start()];
                let tail = &expr[whole.end()..];
                if head.contains(['[', ']']) || tail.contains(['[', ']']) {
                    return Err(PathError::MultipleGroups(expr.to_string()));
                }
                let names: Vec<&str> = RE_PLACEHOLDER
                    .captures_iter(inner)
                    .map(|c| c.get(1).expect("name").as_str())
                    .collect();
                if names.len() != 1 {
                    return Err(PathError::Template(expr.to_string()));
                }
                let name = names[0];
                // The group's separator characters cannot appear inside an
                // atom, otherwise parsing back is ambiguous.
                let separator = inner.replace(&format!("<{name}>"), "");
                idchars.retain(|c| !separator.contains(*c));
                (
                    head.to_string(),
                    Some(GenSegment {
                        text: inner.to_string(),
                        val: name.to_string(),
                    }),
                    tail.to_string(),
                )
            }
            None => {
                if expr.contains(['[', ']']) {
                    return Err(PathError::Template(expr.to_string()));
                }
                (expr.to_string(), None, String::new())
            }
        };

        let segment = |text: &str| Segment {
            text: text.to_string(),
            vals: RE_PLACEHOLDER
                .captures_iter(text)
                .map(|c| c.get(1).expect("name").as_str().to_string())
                .collect(),
        };

        let idexpr = format!(
            "[a-zA-Z0-9{}]",
            regex::escape(&idchars.iter().collect::<String>())
        );

        Ok(Self {
            expr: expr.to_string(),
            noid: noid.to_string(),
            prefix,
            suffix,
            head: segment(&head_text),
            r#gen,
            tail: segment(&tail_text),
            idexpr,
            values,
        })
    }

    fn validate(&self, name: &str, value: &str) -> Result<(), PathError> {
        match self.values.get(name) {
            Some(rule) => rule.check(name, value),
            None => Ok(()),
        }
    }

    /// Render an identifier into its path fragment.
    pub fn to_path(&self, atoms: &[String]) -> Result<String, PathError> {
        if atoms.is_empty() {
            return Ok(self.noid.clone());
        }

        let nhead = self.head.vals.len();
        let ntail = self.tail.vals.len();
        let fixed = nhead + ntail;
        if self.r#gen.is_none() && atoms.len() != fixed {
            return Err(PathError::Arity {
                expected: fixed,
                got: atoms.len(),
            });
        }
        if atoms.len() < fixed {
            return Err(PathError::Arity {
                expected: fixed,
                got: atoms.len(),
            });
        }

        let mut out = self.head.text.clone();
        for (value, name) in atoms.iter().zip(&self.head.vals) {
            self.validate(name, value)?;
            out = out.replacen(&format!("<{name}>"), value, 1);
        }

        if let Some(r#gen) = &self.r#gen {
            for value in &atoms[nhead..atoms.len() - ntail] {
                self.validate(&r#gen.val, value)?;
                out.push_str(&r#gen.text.replacen(&format!("<{}>", r#gen.val), value, 1));
            }
        }

        let mut tail = self.tail.text.clone();
        for (value, name) in atoms[atoms.len() - ntail..].iter().zip(&self.tail.vals) {
            self.validate(name, value)?;
            tail = tail.replacen(&format!("<{name}>"), value, 1);
        }
        out.push_str(&tail);

        Ok(out)
    }

    /// Parse a path fragment back into identifier atoms; the empty
    /// identifier comes back as an empty list.
    pub fn from_path(&self, path: &str) -> Result<Vec<String>, PathError> {
        if path == self.noid {
            return Ok(Vec::new());
        }

        let capture = format!("({}+)", self.idexpr);
        let placeholder_regex = |text: &str, vals: &[String]| {
            let mut expr = regex::escape(text);
            for name in vals {
                expr = expr.replacen(&format!("<{name}>"), &capture, 1);
            }
            expr
        };

        // head, anchored at the start
        let head_expr = format!("^{}", placeholder_regex(&self.head.text, &self.head.vals));
        let head_re = Regex::new(&head_expr).map_err(|_| PathError::Parse(path.to_string()))?;
        let caps = head_re
            .captures(path)
            .ok_or_else(|| PathError::Parse(path.to_string()))?;
        let mut atoms: Vec<String> = Vec::new();
        for (name, m) in self.head.vals.iter().zip(caps.iter().skip(1)) {
            let value = m.ok_or_else(|| PathError::Parse(path.to_string()))?.as_str();
            self.validate(name, value)?;
            atoms.push(value.to_string());
        }
        let mut remain = &path[caps.get(0).expect("match").end()..];

        // tail, anchored at the end
        let tail_expr = format!("{}$", placeholder_regex(&self.tail.text, &self.tail.vals));
        let tail_re = Regex::new(&tail_expr).map_err(|_| PathError::Parse(path.to_string()))?;
        let caps = tail_re
            .captures(remain)
            .ok_or_else(|| PathError::Parse(path.to_string()))?;
        let mut tail_atoms: Vec<String> = Vec::new();
        for (name, m) in self.tail.vals.iter().zip(caps.iter().skip(1)) {
            let value = m.ok_or_else(|| PathError::Parse(path.to_string()))?.as_str();
            self.validate(name, value)?;
            tail_atoms.push(value.to_string());
        }
        remain = &remain[..caps.get(0).expect("match").start()];

        // middle: one generative repetition per remaining atom
        match &self.r#gen {
            Some(r#gen) => {
                let gen_expr = format!(
                    "^{}",
                    placeholder_regex(&r#gen.text, std::slice::from_ref(&r#gen.val))
                );
                let gen_re =
                    Regex::new(&gen_expr).map_err(|_| PathError::Parse(path.to_string()))?;
                while !remain.is_empty() {
                    let caps = gen_re
                        .captures(remain)
                        .ok_or_else(|| PathError::Parse(path.to_string()))?;
                    let value = caps
                        .get(1)
                        .ok_or_else(|| PathError::Parse(path.to_string()))?
                        .as_str();
                    self.validate(&r#gen.val, value)?;
                    atoms.push(value.to_string());
                    remain = &remain[caps.get(0).expect("match").end()..];
                }
            }
            None => {
                if !remain.is_empty() {
                    return Err(PathError::Parse(path.to_string()));
                }
            }
        }

        atoms.extend(tail_atoms);
        Ok(atoms)
    }
}

impl std::fmt::Debug for IdTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdTemplate({})", self.expr)
    }
}

/// Builder for [`PathScheme`].
pub struct PathSchemeBuilder {
    layout: String,
    index: String,
    branch: String,
    noindex: String,
    nobranch: String,
    name: Option<String>,
    default_branch: Option<Branch>,
    values: HashMap<String, ValueRule>,
}

impl PathSchemeBuilder {
    pub fn layout(mut self, layout: impl Into<String>) -> Self {
        self.layout = layout.into();
        self
    }

    pub fn index(mut self, expr: impl Into<String>) -> Self {
        self.index = expr.into();
        self
    }

    pub fn branch(mut self, expr: impl Into<String>) -> Self {
        self.branch = expr.into();
        self
    }

    pub fn noindex(mut self, literal: impl Into<String>) -> Self {
        self.noindex = literal.into();
        self
    }

    pub fn nobranch(mut self, literal: impl Into<String>) -> Self {
        self.nobranch = literal.into();
        self
    }

    /// Dedicate the scheme to a single target name; the layout may then omit
    /// `<name>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pin the branch: written targets must carry it (or none), the path
    /// omits it, parsing restores it.
    pub fn default_branch(mut self, branch: Branch) -> Self {
        self.default_branch = Some(branch);
        self
    }

    pub fn value(mut self, placeholder: impl Into<String>, rule: ValueRule) -> Self {
        self.values.insert(placeholder.into(), rule);
        self
    }

    pub fn build(self) -> Result<PathScheme, PathError> {
        if !self.layout.contains("<index>") {
            return Err(PathError::MissingField("<index>"));
        }
        if !self.layout.contains("<branch>") {
            return Err(PathError::MissingField("<branch>"));
        }
        if self.name.is_none() && !self.layout.contains("<name>") {
            return Err(PathError::MissingField("<name>"));
        }

        // Placeholder rules apply to both sub-templates, as in the layout
        // they came from.
        let rules = |src: &HashMap<String, ValueRule>| {
            src.iter()
                .map(|(k, v)| {
                    let rule = match v {
                        ValueRule::OneOf(list) => ValueRule::OneOf(list.clone()),
                        ValueRule::Matches(re) => ValueRule::Matches(re.clone()),
                    };
                    (k.clone(), rule)
                })
                .collect()
        };

        Ok(PathScheme {
            layout: self.layout.clone(),
            name: self.name,
            index: IdTemplate::new(&self.index, &self.noindex, rules(&self.values))?,
            branch: IdTemplate::new(&self.branch, &self.nobranch, rules(&self.values))?,
            default_branch: self.default_branch,
        })
    }
}

/// Bidirectional `Target ↔ relative path` converter.
pub struct PathScheme {
    layout: String,
    name: Option<String>,
    index: IdTemplate,
    branch: IdTemplate,
    default_branch: Option<Branch>,
}

impl PathScheme {
    pub fn builder() -> PathSchemeBuilder {
        PathSchemeBuilder {
            layout: "<index>/<name><branch>".to_string(),
            index: "<id>[.<id>]".to_string(),
            branch: "~<id>[.<id>]".to_string(),
            noindex: "_".to_string(),
            nobranch: String::new(),
            name: None,
            default_branch: None,
            values: HashMap::new(),
        }
    }

    /// Default working-directory layout: `<index>/<name><branch>`.
    pub fn workdir() -> Self {
        Self::builder().build().expect("default scheme")
    }

    /// Layout for a directory dedicated to a single target name:
    /// `<index><branch>` at the storage root.
    pub fn dedicated(name: impl Into<String>) -> Result<Self, PathError> {
        Self::builder()
            .layout("<index><branch>")
            .name(name)
            .build()
    }

    pub fn pinned_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn render(&self, target: &Target) -> Result<String, PathError> {
        if let Some(name) = &self.name
            && target.name() != name
        {
            return Err(PathError::Name(target.name().to_string()));
        }

        let index = self.index.to_path(target.index().atoms())?;

        let branch = match &self.default_branch {
            Some(pinned) => {
                if !target.branch().is_empty() && target.branch() != pinned {
                    return Err(PathError::Branch(target.branch().to_string()));
                }
                self.branch.to_path(&[])?
            }
            None => self.branch.to_path(target.branch().atoms())?,
        };

        Ok(self
            .layout
            .replace("<name>", target.name())
            .replace("<index>", &index)
            .replace("<branch>", &branch))
    }

    fn parse(&self, path: &str) -> Result<Target, PathError> {
        let esc = |s: &str| regex::escape(s);
        let regindex = format!(
            "(?P<index>{}.+?{}|{})",
            esc(&self.index.prefix),
            esc(&self.index.suffix),
            esc(&self.index.noid)
        );
        let regbranch = format!(
            "(?P<branch>{}.+?{}|{})",
            esc(&self.branch.prefix),
            esc(&self.branch.suffix),
            esc(&self.branch.noid)
        );
        let regname = match &self.name {
            Some(name) => format!("(?P<name>{})", esc(name)),
            None => r"(?P<name>[0-9a-zA-Z+\-_]+?)".to_string(),
        };

        // Escape the literal parts of the layout, then substitute the three
        // field patterns.
        let mut expr = String::from("^");
        let mut rest = self.layout.as_str();
        while let Some(m) = RE_PLACEHOLDER.find(rest) {
            expr.push_str(&esc(&rest[..m.start()]));
            expr.push_str(match m.as_str() {
                "<index>" => &regindex,
                "<branch>" => &regbranch,
                "<name>" => &regname,
                other => return Err(PathError::Template(other.to_string())),
            });
            rest = &rest[m.end()..];
        }
        expr.push_str(&esc(rest));
        expr.push('$');

        let re = Regex::new(&expr).map_err(|_| PathError::Template(self.layout.clone()))?;
        let caps = re
            .captures(path)
            .ok_or_else(|| PathError::Parse(path.to_string()))?;

        let name = match (&self.name, caps.name("name")) {
            (Some(pinned), None) => pinned.clone(),
            (Some(pinned), Some(m)) if m.as_str() == pinned => pinned.clone(),
            (Some(_), Some(m)) => return Err(PathError::Name(m.as_str().to_string())),
            (None, Some(m)) => m.as_str().to_string(),
            (None, None) => return Err(PathError::Parse(path.to_string())),
        };

        let index_atoms = match caps.name("index") {
            Some(m) => self.index.from_path(m.as_str())?,
            None => Vec::new(),
        };

        let branch_atoms = match &self.default_branch {
            Some(pinned) => pinned.atoms().to_vec(),
            None => match caps.name("branch") {
                Some(m) => self.branch.from_path(m.as_str())?,
                None => Vec::new(),
            },
        };

        let index = Index::new(index_atoms).map_err(|e| PathError::Value {
            name: "index".to_string(),
            reason: e.to_string(),
        })?;
        let branch = Branch::new(branch_atoms).map_err(|e| PathError::Value {
            name: "branch".to_string(),
            reason: e.to_string(),
        })?;

        Target::new(name, index, branch).map_err(|e| PathError::Parse(e.to_string()))
    }

    /// Render a target to its relative path, verifying the round trip.
    pub fn to_path(&self, target: &Target) -> Result<String, PathError> {
        let path = self.render(target)?;
        let back = self
            .parse(&path)
            .map_err(|_| PathError::RoundTrip(path.clone()))?;
        // under a pinned branch, an empty-branch target parses back with
        // the pinned one; that still counts as a round trip
        let pinned_empty = self.default_branch.is_some()
            && target.branch().is_empty()
            && back.name() == target.name()
            && back.index() == target.index();
        if &back != target && !pinned_empty {
            return Err(PathError::RoundTrip(path));
        }
        Ok(normalize(&path))
    }

    /// Parse a relative path into a target, verifying the round trip.
    pub fn from_path(&self, path: impl AsRef<Utf8Path>) -> Result<Target, PathError> {
        let path = normalize(path.as_ref().as_str());
        let target = self.parse(&path)?;
        if self.render(&target)? != path {
            return Err(PathError::RoundTrip(path));
        }
        Ok(target)
    }
}

impl std::fmt::Debug for PathScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PathScheme(layout={}; index={:?}; branch={:?}; name={:?})",
            self.layout, self.index, self.branch, self.name
        )
    }
}

/// Collapse a path onto its plain slash-separated components.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, index: &[&str], branch: &[&str]) -> Target {
        Target::new(
            name,
            Index::new(index.iter().copied()).unwrap(),
            Branch::new(branch.iter().copied()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_workdir_to_path() {
        let scheme = PathScheme::workdir();

        assert_eq!(scheme.to_path(&target("name", &[], &[])).unwrap(), "_/name");
        assert_eq!(
            scheme.to_path(&target("name", &["id"], &[])).unwrap(),
            "id/name"
        );
        assert_eq!(
            scheme
                .to_path(&target("name", &["id1", "id2"], &[]))
                .unwrap(),
            "id1.id2/name"
        );
        assert_eq!(
            scheme.to_path(&target("name", &[], &["branch"])).unwrap(),
            "_/name~branch"
        );
        assert_eq!(
            scheme
                .to_path(&target("name", &["id"], &["b1", "b2"]))
                .unwrap(),
            "id/name~b1.b2"
        );
        assert_eq!(
            scheme
                .to_path(&target("so+me-na_me", &["A+B", "C-D", "E_F"], &["A+B"]))
                .unwrap(),
            "A+B.C-D.E_F/so+me-na_me~A+B"
        );
    }

    #[test]
    fn test_workdir_from_path() {
        let scheme = PathScheme::workdir();

        assert_eq!(scheme.from_path("_/name").unwrap(), target("name", &[], &[]));
        assert_eq!(
            scheme.from_path("id/name").unwrap(),
            target("name", &["id"], &[])
        );
        assert_eq!(
            scheme.from_path("id1.id2/name").unwrap(),
            target("name", &["id1", "id2"], &[])
        );
        assert_eq!(
            scheme.from_path("_/name~branch").unwrap(),
            target("name", &[], &["branch"])
        );
        assert_eq!(
            scheme.from_path("id/name~b1.b2").unwrap(),
            target("name", &["id"], &["b1", "b2"])
        );

        // trailing slash is normalized away
        assert_eq!(
            scheme.from_path("_/name/").unwrap(),
            target("name", &[], &[])
        );

        // nested directories do not parse as an index
        assert!(scheme.from_path("a/b.c/d/name").is_err());
        assert!(scheme.from_path("").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let scheme = PathScheme::workdir();
        for t in [
            target("name", &[], &[]),
            target("name", &["a"], &[]),
            target("name", &["a", "b", "c"], &["x", "y"]),
            target("a-b+c", &["1"], &["br"]),
        ] {
            let path = scheme.to_path(&t).unwrap();
            assert_eq!(scheme.from_path(&path).unwrap(), t);
        }
    }

    #[test]
    fn test_dedicated() {
        let scheme = PathScheme::dedicated("name").unwrap();

        assert_eq!(
            scheme.to_path(&target("name", &["id1", "id2"], &[])).unwrap(),
            "id1.id2"
        );
        assert_eq!(
            scheme
                .to_path(&target("name", &[], &["br1", "br2"]))
                .unwrap(),
            "_~br1.br2"
        );
        assert_eq!(
            scheme
                .to_path(&target("name", &["id1"], &["br1"]))
                .unwrap(),
            "id1~br1"
        );
        assert!(scheme.to_path(&target("other", &["id"], &[])).is_err());

        assert_eq!(
            scheme.from_path("id1.id2~br1").unwrap(),
            target("name", &["id1", "id2"], &["br1"])
        );
        assert_eq!(
            scheme.from_path("_~br1.br2").unwrap(),
            target("name", &[], &["br1", "br2"])
        );
        assert!(scheme.from_path("").is_err());
    }

    #[test]
    fn test_fixed_length_template() {
        let scheme = PathScheme::builder()
            .layout("<index>/<name><branch>")
            .index("<a>.<b>")
            .build()
            .unwrap();

        assert_eq!(
            scheme.to_path(&target("name", &["x", "y"], &[])).unwrap(),
            "x.y/name"
        );
        // wrong arity is rejected
        assert!(scheme.to_path(&target("name", &["x"], &[])).is_err());
        assert!(
            scheme
                .to_path(&target("name", &["x", "y", "z"], &[]))
                .is_err()
        );
    }

    #[test]
    fn test_value_rules() {
        let scheme = PathScheme::builder()
            .value("id", ValueRule::OneOf(vec!["a".into(), "b".into()]))
            .build()
            .unwrap();

        assert!(scheme.to_path(&target("name", &["a"], &[])).is_ok());
        assert!(scheme.to_path(&target("name", &["c"], &[])).is_err());
        assert!(scheme.from_path("c/name").is_err());

        let scheme = PathScheme::builder()
            .value("id", ValueRule::Matches(Regex::new(r"[0-9]+").unwrap()))
            .build()
            .unwrap();
        assert!(scheme.to_path(&target("name", &["123"], &[])).is_ok());
        assert!(scheme.to_path(&target("name", &["abc"], &[])).is_err());
    }

    #[test]
    fn test_default_branch() {
        let branch = Branch::new(["pinned"]).unwrap();
        let scheme = PathScheme::builder()
            .default_branch(branch.clone())
            .build()
            .unwrap();

        // the pinned branch is omitted from the path
        assert_eq!(
            scheme
                .to_path(&target("name", &["id"], &["pinned"]))
                .unwrap(),
            "id/name"
        );
        // the empty branch renders the same way
        assert_eq!(
            scheme.to_path(&target("name", &["id"], &[])).unwrap(),
            "id/name"
        );
        // any other branch is refused
        assert!(scheme.to_path(&target("name", &["id"], &["other"])).is_err());

        // parsing restores the pinned branch
        let parsed = scheme.from_path("id/name").unwrap();
        assert_eq!(parsed.branch(), &branch);
    }

    #[test]
    fn test_template_errors() {
        assert!(PathScheme::builder().layout("<name><branch>").build().is_err());
        assert!(PathScheme::builder().layout("<index><branch>").build().is_err());
        assert!(PathScheme::builder().index("plain").build().is_err());
        assert!(
            PathScheme::builder()
                .index("<id>[.<id>][-<id>]")
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_generative_separator_excluded_from_atoms() {
        // with `-` as the group separator, atoms may no longer contain `-`
        let scheme = PathScheme::builder()
            .index("<id>[-<id>]")
            .build()
            .unwrap();

        assert_eq!(
            scheme
                .to_path(&target("name", &["a", "b", "c"], &[]))
                .unwrap(),
            "a-b-c/name"
        );
        assert_eq!(
            scheme.from_path("a-b-c/name").unwrap(),
            target("name", &["a", "b", "c"], &[])
        );
    }
}
