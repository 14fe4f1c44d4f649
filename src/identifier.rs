//! Index and branch identifiers.
//!
//! Every logical data point in a pipeline is named by an [`Identifier`], the
//! pair of an [`Index`] (what the data is about) and a [`Branch`] (which
//! variant of the processing produced it). Both are ordered lists of string
//! atoms with a distinguished empty state.
//!
//! The two types share the atom grammar but differ in two places that drive
//! scheduling and fallback:
//!
//! * ordering: an empty `Index` sorts *after* every non-empty one, an empty
//!   `Branch` sorts *before* — this is what makes producers drain ahead of
//!   their aggregating consumers in the task queue;
//! * duplicates: an `Index` may repeat atoms, a `Branch` never does, and
//!   branch concatenation is set-like (idempotent, order-preserving).

use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IdentifierError;

/// Atoms are restricted so that every identifier embeds losslessly in a path.
static RE_ATOM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_+:\-()]+$").expect("atom regex"));

/// Literal used where a path needs to spell out an empty identifier.
pub const NULL_ID: &str = "_";

fn check_atoms(atoms: Vec<String>) -> Result<Vec<String>, IdentifierError> {
    // A lone blank value collapses to the empty identifier; blanks mixed with
    // real atoms are rejected.
    let atoms: Vec<String> = atoms.into_iter().map(|a| a.trim().to_string()).collect();
    if atoms.iter().all(|a| a.is_empty()) {
        return Ok(Vec::new());
    }
    for atom in &atoms {
        if !RE_ATOM.is_match(atom) {
            return Err(IdentifierError::InvalidAtom(atom.clone()));
        }
    }
    Ok(atoms)
}

fn match_atoms(atoms: &[String], pattern: &str) -> bool {
    if atoms.is_empty() {
        return pattern.is_empty() || pattern == "*";
    }
    if pattern.is_empty() {
        return false;
    }
    // Escape everything except `*`, which becomes a greedy wildcard over the
    // dot-joined form.
    let expr = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    let joined = atoms.join(".");
    match Regex::new(&format!("^{expr}$")) {
        Ok(re) => re.is_match(&joined),
        Err(_) => false,
    }
}

fn fmt_atoms(atoms: &[String], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if atoms.is_empty() {
        return f.write_str(NULL_ID);
    }
    f.write_str(&atoms.join("."))
}

/// Task index: the "what" coordinate of an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Index {
    atoms: Vec<String>,
}

impl Index {
    pub fn empty() -> Self {
        Self { atoms: Vec::new() }
    }

    pub fn new<I, S>(atoms: I) -> Result<Self, IdentifierError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let atoms = atoms.into_iter().map(Into::into).collect();
        Ok(Self {
            atoms: check_atoms(atoms)?,
        })
    }

    /// Single-atom index.
    pub fn atom(atom: impl Into<String>) -> Result<Self, IdentifierError> {
        Self::new([atom.into()])
    }

    pub fn atoms(&self) -> &[String] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn concat(&self, other: &Self) -> Self {
        let mut atoms = self.atoms.clone();
        atoms.extend(other.atoms.iter().cloned());
        Self { atoms }
    }

    /// Drop the last `n` atoms. `Some(empty)` iff `n == len`, `None` beyond.
    pub fn crop(&self, n: usize) -> Option<Self> {
        if n > self.atoms.len() {
            return None;
        }
        Some(Self {
            atoms: self.atoms[..self.atoms.len() - n].to_vec(),
        })
    }

    /// Wildcard match against the dot-joined form; the empty index matches
    /// only an empty pattern or `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        match_atoms(&self.atoms, pattern)
    }
}

impl TryFrom<Vec<String>> for Index {
    type Error = IdentifierError;

    fn try_from(atoms: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(atoms)
    }
}

impl From<Index> for Vec<String> {
    fn from(index: Index) -> Self {
        index.atoms
    }
}

impl Add<&Index> for &Index {
    type Output = Index;

    fn add(self, other: &Index) -> Index {
        self.concat(other)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_atoms(&self.atoms, f)
    }
}

impl Ord for Index {
    fn cmp(&self, other: &Self) -> Ordering {
        // Empty sorts last: aggregating tasks with a null output index drain
        // after every producer.
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.atoms.cmp(&other.atoms),
        }
    }
}

impl PartialOrd for Index {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Task branch: the "which variant" coordinate of an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Branch {
    atoms: Vec<String>,
}

impl Branch {
    pub fn empty() -> Self {
        Self { atoms: Vec::new() }
    }

    pub fn new<I, S>(atoms: I) -> Result<Self, IdentifierError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let atoms = atoms.into_iter().map(Into::into).collect();
        Ok(Self {
            atoms: dedup(check_atoms(atoms)?),
        })
    }

    /// Single-atom branch.
    pub fn atom(atom: impl Into<String>) -> Result<Self, IdentifierError> {
        Self::new([atom.into()])
    }

    pub fn atoms(&self) -> &[String] {
        &self.atoms
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Set-like concatenation: atoms already present are not repeated.
    pub fn concat(&self, other: &Self) -> Self {
        let mut atoms = self.atoms.clone();
        for atom in &other.atoms {
            if !atoms.contains(atom) {
                atoms.push(atom.clone());
            }
        }
        Self { atoms }
    }

    /// Drop the last `n` atoms. `Some(empty)` iff `n == len`, `None` beyond.
    pub fn crop(&self, n: usize) -> Option<Self> {
        if n > self.atoms.len() {
            return None;
        }
        Some(Self {
            atoms: self.atoms[..self.atoms.len() - n].to_vec(),
        })
    }

    /// Wildcard match against the dot-joined form; the empty branch matches
    /// only an empty pattern or `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        match_atoms(&self.atoms, pattern)
    }
}

fn dedup(atoms: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(atoms.len());
    for atom in atoms {
        if !seen.contains(&atom) {
            seen.push(atom);
        }
    }
    seen
}

impl TryFrom<Vec<String>> for Branch {
    type Error = IdentifierError;

    fn try_from(atoms: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(atoms)
    }
}

impl From<Branch> for Vec<String> {
    fn from(branch: Branch) -> Self {
        branch.atoms
    }
}

impl Add<&Branch> for &Branch {
    type Output = Branch;

    fn add(self, other: &Branch) -> Branch {
        self.concat(other)
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_atoms(&self.atoms, f)
    }
}

impl Ord for Branch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Empty sorts first: trunk targets resolve before branched variants.
        match (self.is_empty(), other.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.atoms.cmp(&other.atoms),
        }
    }
}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The `(index, branch)` pair naming one logical data point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub index: Index,
    pub branch: Branch,
}

impl Identifier {
    pub fn new(index: Index, branch: Branch) -> Self {
        Self { index, branch }
    }

    /// The distinguished "no id": both coordinates empty.
    pub fn none() -> Self {
        Self {
            index: Index::empty(),
            branch: Branch::empty(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.index.is_empty() && self.branch.is_empty()
    }

    /// Stable key form, used to address per-identifier parameter dispatch.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `1~br1`; trailing `~` marks the empty branch, `_` the empty index.
        write!(f, "{}~", self.index)?;
        if !self.branch.is_empty() {
            write!(f, "{}", self.branch)?;
        }
        Ok(())
    }
}

/// Broadcast indices against branches into identifier pairs.
///
/// A single value on either side is combined with every value of the other;
/// equal-length lists are zipped; anything else is an error. Empty lists
/// stand for the single empty value.
pub fn ravel_identifiers(
    indices: &[Index],
    branches: &[Branch],
) -> Result<Vec<Identifier>, IdentifierError> {
    let empty_ix = [Index::empty()];
    let empty_br = [Branch::empty()];
    let indices: &[Index] = if indices.is_empty() { &empty_ix } else { indices };
    let branches: &[Branch] = if branches.is_empty() {
        &empty_br
    } else {
        branches
    };

    if indices.len() == 1 || branches.len() == 1 {
        let mut ids = Vec::with_capacity(indices.len() * branches.len());
        for index in indices {
            for branch in branches {
                ids.push(Identifier::new(index.clone(), branch.clone()));
            }
        }
        Ok(ids)
    } else if indices.len() == branches.len() {
        Ok(indices
            .iter()
            .zip(branches)
            .map(|(ix, br)| Identifier::new(ix.clone(), br.clone()))
            .collect())
    } else {
        Err(IdentifierError::Ravel)
    }
}
