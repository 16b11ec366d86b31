//! In-memory file source for embedders and tests.

use std::{
   collections::BTreeMap,
   sync::atomic::{AtomicI32, AtomicU64, Ordering},
};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{DEFAULT_CHARSET, FileMetadata, FileSource, file_type_of, looks_binary};
use crate::{
   Error, Result,
   types::{FileId, FileTimestamp},
};

struct MemoryFile {
   path:     String,
   charset:  String,
   bytes:    Bytes,
   revision: u64,
}

/// Files held in memory. Ids start at 1 and are never reused; every write
/// bumps a logical revision that serves as the file timestamp.
pub struct MemoryFileSource {
   files:      RwLock<BTreeMap<FileId, MemoryFile>>,
   next_id:    AtomicI32,
   revision:   AtomicU64,
   generation: AtomicU64,
}

impl Default for MemoryFileSource {
   fn default() -> Self {
      Self::new()
   }
}

impl MemoryFileSource {
   pub fn new() -> Self {
      Self {
         files:      RwLock::new(BTreeMap::new()),
         next_id:    AtomicI32::new(1),
         revision:   AtomicU64::new(0),
         generation: AtomicU64::new(0),
      }
   }

   fn next_revision(&self) -> u64 {
      self.revision.fetch_add(1, Ordering::AcqRel) + 1
   }

   pub fn add(&self, path: impl Into<String>, bytes: impl Into<Bytes>) -> FileId {
      let id = FileId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
      let file = MemoryFile {
         path:     path.into(),
         charset:  DEFAULT_CHARSET.to_string(),
         bytes:    bytes.into(),
         revision: self.next_revision(),
      };
      self.files.write().insert(id, file);
      id
   }

   /// Replaces content; returns `false` for unknown ids.
   pub fn set_content(&self, id: FileId, bytes: impl Into<Bytes>) -> bool {
      let revision = self.next_revision();
      let mut files = self.files.write();
      let Some(file) = files.get_mut(&id) else {
         return false;
      };
      file.bytes = bytes.into();
      file.revision = revision;
      true
   }

   pub fn set_charset(&self, id: FileId, charset: impl Into<String>) -> bool {
      let revision = self.next_revision();
      let mut files = self.files.write();
      let Some(file) = files.get_mut(&id) else {
         return false;
      };
      file.charset = charset.into();
      file.revision = revision;
      true
   }

   pub fn remove(&self, id: FileId) -> bool {
      self.files.write().remove(&id).is_some()
   }

   pub fn path_of(&self, id: FileId) -> Option<String> {
      self.files.read().get(&id).map(|f| f.path.clone())
   }

   pub fn find(&self, path: &str) -> Option<FileId> {
      self
         .files
         .read()
         .iter()
         .find_map(|(id, f)| (f.path == path).then_some(*id))
   }

   pub fn bump_generation(&self) {
      self.generation.fetch_add(1, Ordering::AcqRel);
   }
}

impl FileSource for MemoryFileSource {
   fn files(&self) -> Result<Vec<FileId>> {
      Ok(self.files.read().keys().copied().collect())
   }

   fn metadata(&self, id: FileId) -> Result<Option<FileMetadata>> {
      Ok(self.files.read().get(&id).map(|f| FileMetadata {
         id,
         path: f.path.clone(),
         file_type: file_type_of(&f.path),
         charset: f.charset.clone(),
         timestamp: FileTimestamp { modified_ms: f.revision, len: f.bytes.len() as u64 },
         is_binary: looks_binary(&f.bytes),
      }))
   }

   fn content(&self, id: FileId) -> Result<Bytes> {
      self
         .files
         .read()
         .get(&id)
         .map(|f| f.bytes.clone())
         .ok_or(Error::UnknownFile(id))
   }

   fn generation(&self) -> u64 {
      self.generation.load(Ordering::Acquire)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn writes_change_the_timestamp() {
      let source = MemoryFileSource::new();
      let id = source.add("a.txt", "hello");
      let before = source.metadata(id).unwrap().unwrap().timestamp;
      assert!(source.set_content(id, "hello"));
      let after = source.metadata(id).unwrap().unwrap().timestamp;
      assert_ne!(before, after);
      assert_eq!(source.find("a.txt"), Some(id));
      assert!(source.remove(id));
      assert!(source.metadata(id).unwrap().is_none());
      assert!(matches!(source.content(id), Err(Error::UnknownFile(_))));
   }
}
