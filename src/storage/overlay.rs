//! In-memory overlay for uncommitted content.
//!
//! A file present in the overlay shadows everything the backend holds for
//! it: its buffered map is the complete current data for that file.

use std::collections::{BTreeMap, HashMap};

use crate::{
   error::StorageError,
   storage::backend::Postings,
   types::{FileId, Key, KeyValueMap, Value},
};

#[derive(Default)]
pub struct Overlay {
   files:    HashMap<FileId, KeyValueMap>,
   inverted: HashMap<Key, Postings>,
   entries:  usize,
}

impl Overlay {
   pub fn contains_file(&self, file: FileId) -> bool {
      self.files.contains_key(&file)
   }

   pub fn data_of(&self, file: FileId) -> Option<&KeyValueMap> {
      self.files.get(&file)
   }

   pub fn files(&self) -> impl Iterator<Item = FileId> + '_ {
      self.files.keys().copied()
   }

   pub fn read(&self, key: &str) -> Option<&Postings> {
      self.inverted.get(key)
   }

   pub fn keys(&self) -> impl Iterator<Item = &Key> {
      self.inverted.keys()
   }

   pub const fn entries(&self) -> usize {
      self.entries
   }

   pub fn is_empty(&self) -> bool {
      self.files.is_empty()
   }

   /// Installs `data` as the complete buffered state of `file`.
   pub fn replace(
      &mut self,
      file: FileId,
      data: KeyValueMap,
      limit: usize,
   ) -> Result<(), StorageError> {
      let previous = self.files.get(&file).map_or(0, BTreeMap::len);
      if self.entries - previous + data.len() > limit {
         return Err(StorageError::BufferOverflow { limit });
      }
      self.unlink(file);
      for (key, value) in &data {
         self.inverted.entry(key.clone()).or_default().insert(file, value.clone());
      }
      self.entries += data.len();
      self.files.insert(file, data);
      Ok(())
   }

   /// Sets one key of `file`, seeding its buffered state with `seed` first.
   pub fn add(
      &mut self,
      file: FileId,
      key: &str,
      value: Value,
      seed: impl FnOnce() -> KeyValueMap,
      limit: usize,
   ) -> Result<(), StorageError> {
      let mut data = self.files.get(&file).cloned().unwrap_or_else(seed);
      data.insert(key.to_string(), value);
      self.replace(file, data, limit)
   }

   pub fn remove(
      &mut self,
      file: FileId,
      key: &str,
      seed: impl FnOnce() -> KeyValueMap,
      limit: usize,
   ) -> Result<bool, StorageError> {
      let mut data = self.files.get(&file).cloned().unwrap_or_else(seed);
      let removed = data.remove(key).is_some();
      self.replace(file, data, limit)?;
      Ok(removed)
   }

   pub fn drop_file(&mut self, file: FileId) -> bool {
      let present = self.files.contains_key(&file);
      self.unlink(file);
      present
   }

   /// Empties the overlay, returning the files it shadowed.
   pub fn drain(&mut self) -> Vec<FileId> {
      let files = self.files.keys().copied().collect();
      self.files.clear();
      self.inverted.clear();
      self.entries = 0;
      files
   }

   fn unlink(&mut self, file: FileId) {
      let Some(old) = self.files.remove(&file) else {
         return;
      };
      self.entries -= old.len();
      for key in old.keys() {
         if let Some(postings) = self.inverted.get_mut(key) {
            postings.remove(&file);
            if postings.is_empty() {
               self.inverted.remove(key);
            }
         }
      }
   }
}
