//! Identifiers and value types shared by every layer of the engine.

use std::{borrow::Borrow, collections::BTreeMap, collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Key extracted by an index.
pub type Key = String;

/// Opaque value associated with a (key, file) pair.
pub type Value = Vec<u8>;

/// Output of one extraction: every key a file contributes, with its value.
pub type KeyValueMap = BTreeMap<Key, Value>;

/// Stable per-file identifier handed out by the file source.
///
/// Live ids are strictly positive. A negated id is the tombstone of a file
/// whose data still has to be purged from the indices.
#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct FileId(i32);

impl FileId {
   pub const fn new(raw: i32) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> i32 {
      self.0
   }

   pub const fn is_tombstone(self) -> bool {
      self.0 < 0
   }

   /// Tombstone form of this id. Idempotent.
   pub const fn tombstone(self) -> Self {
      if self.0 > 0 { Self(-self.0) } else { self }
   }

   /// Live form of this id. Idempotent; `i32::MIN` saturates.
   pub const fn live(self) -> Self {
      Self(self.0.saturating_abs())
   }
}

impl fmt::Display for FileId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_tombstone() {
         write!(f, "#{}(removed)", self.0.unsigned_abs())
      } else {
         write!(f, "#{}", self.0)
      }
   }
}

impl fmt::Debug for FileId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "FileId({})", self.0)
   }
}

/// Unique name of a registered index.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct IndexId(Arc<str>);

impl IndexId {
   pub fn new(name: impl Into<Arc<str>>) -> Self {
      Self(name.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl Borrow<str> for IndexId {
   fn borrow(&self) -> &str {
      &self.0
   }
}

impl From<&str> for IndexId {
   fn from(name: &str) -> Self {
      Self::new(name)
   }
}

impl fmt::Display for IndexId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl fmt::Debug for IndexId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "IndexId({})", self.0)
   }
}

/// Modification marker of a file as reported by the source: mtime plus size.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct FileTimestamp {
   pub modified_ms: u64,
   pub len:         u64,
}

/// Restricts a query to a subset of files.
#[derive(Debug, Clone, Default)]
pub enum SearchScope {
   #[default]
   Everything,
   Files(Arc<HashSet<FileId>>),
}

impl SearchScope {
   pub fn files(ids: impl IntoIterator<Item = FileId>) -> Self {
      Self::Files(Arc::new(ids.into_iter().map(FileId::live).collect()))
   }

   /// Whether `file` (or the file a tombstone stands for) is in scope.
   pub fn contains(&self, file: FileId) -> bool {
      match self {
         Self::Everything => true,
         Self::Files(ids) => ids.contains(&file.live()),
      }
   }
}
