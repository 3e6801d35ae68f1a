//! Core types for idbclient
//!
//! Defines keys, key ranges, schema metadata (the database "spec" snapshot),
//! transaction modes and cursor directions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{IdbError, Result};

/// A database key
///
/// Keys follow the IndexedDB total order: every number sorts before every
/// date, dates before strings, strings before binary keys and binary keys
/// before arrays. Arrays compare element-wise, shorter prefix first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    /// Numeric key (NaN is rejected by [`Key::number`])
    Number(f64),
    /// Date key, milliseconds since the epoch
    Date(f64),
    /// String key
    String(String),
    /// Binary key
    Binary(Vec<u8>),
    /// Compound key
    Array(Vec<Key>),
}

impl Key {
    /// Create a numeric key, rejecting NaN
    pub fn number(value: f64) -> Result<Self> {
        if value.is_nan() {
            return Err(IdbError::Data("NaN is not a valid key".into()));
        }
        Ok(Key::Number(value))
    }

    /// Create a string key
    pub fn string(value: impl Into<String>) -> Self {
        Key::String(value.into())
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Binary(_) => 3,
            Key::Array(_) => 4,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) | (Key::Date(a), Key::Date(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    match left.cmp(right) {
                        Ordering::Equal => continue,
                        unequal => return unequal,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Key::Number(v) | Key::Date(v) => v.to_bits().hash(state),
            Key::String(s) => s.hash(state),
            Key::Binary(b) => b.hash(state),
            Key::Array(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(v) => write!(f, "{}", v),
            Key::Date(v) => write!(f, "Date({})", v),
            Key::String(s) => write!(f, "\"{}\"", s),
            Key::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A key range; `None` bounds are unbounded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Range matching exactly one key
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Bounded range, validated like `IDBKeyRange.bound`
    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Result<Self> {
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(IdbError::Data("Lower bound is greater than upper bound".into()))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(IdbError::Data("Equal bounds with an open end match nothing".into()))
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    /// Range with only a lower bound
    pub fn lower_bound(lower: Key, open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    /// Range with only an upper bound
    pub fn upper_bound(upper: Key, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        }
    }

    /// Check whether a key lies inside this range
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

/// Key path of an object store or index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Out-of-line keys
    None,
    /// Single dotted path
    Single(String),
    /// Compound path
    Array(Vec<String>),
}

impl KeyPath {
    pub fn is_none(&self) -> bool {
        matches!(self, KeyPath::None)
    }
}

/// Metadata of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub id: i64,
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

/// Metadata of one object store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreMetadata {
    pub id: i64,
    pub name: String,
    pub key_path: KeyPath,
    pub auto_increment: bool,
}

/// An object store together with its indexes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreSpec {
    pub metadata: ObjectStoreMetadata,
    pub indexes: Vec<IndexMetadata>,
}

impl ObjectStoreSpec {
    pub fn new(metadata: ObjectStoreMetadata) -> Self {
        Self {
            metadata,
            indexes: Vec::new(),
        }
    }

    /// Find an index by name
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indexes.iter().find(|idx| idx.name == name)
    }
}

/// The schema snapshot visible to a database handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
    pub version: u64,
    pub object_stores: Vec<ObjectStoreSpec>,
}

impl DatabaseSpec {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
            object_stores: Vec::new(),
        }
    }

    /// Find an object store by name
    pub fn object_store(&self, name: &str) -> Option<&ObjectStoreSpec> {
        self.object_stores.iter().find(|s| s.metadata.name == name)
    }

    /// Find an object store by name, mutably
    pub fn object_store_mut(&mut self, name: &str) -> Option<&mut ObjectStoreSpec> {
        self.object_stores.iter_mut().find(|s| s.metadata.name == name)
    }

    /// Find an object store by id
    pub fn object_store_by_id(&self, id: i64) -> Option<&ObjectStoreSpec> {
        self.object_stores.iter().find(|s| s.metadata.id == id)
    }

    /// Object store names in sorted order
    pub fn object_store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .object_stores
            .iter()
            .map(|s| s.metadata.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Ids of every object store in this snapshot
    pub fn object_store_ids(&self) -> Vec<i64> {
        self.object_stores.iter().map(|s| s.metadata.id).collect()
    }
}

/// Transaction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write with a durable flush on commit
    ReadWriteFlush,
    /// Schema-changing transaction created by an open request
    VersionChange,
}

impl TransactionMode {
    /// Check whether this mode allows writes
    pub fn is_writable(&self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "readonly"),
            TransactionMode::ReadWrite => write!(f, "readwrite"),
            TransactionMode::ReadWriteFlush => write!(f, "readwriteflush"),
            TransactionMode::VersionChange => write!(f, "versionchange"),
        }
    }
}

/// Cursor iteration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorDirection {
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl CursorDirection {
    /// Check whether the cursor moves towards larger keys
    pub fn is_forward(&self) -> bool {
        matches!(self, CursorDirection::Next | CursorDirection::NextUnique)
    }

    /// Check whether duplicate index keys are skipped
    pub fn is_unique(&self) -> bool {
        matches!(self, CursorDirection::NextUnique | CursorDirection::PrevUnique)
    }
}

impl Default for CursorDirection {
    fn default() -> Self {
        CursorDirection::Next
    }
}

/// Origin descriptor carried by a permission challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    /// Privileged code, always allowed
    System,
    /// Web content from the given origin
    Content { origin: String },
    /// Opaque origin, never persisted
    Null,
}
