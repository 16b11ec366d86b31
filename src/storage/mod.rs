//! Per-index inverted storage.
//!
//! Writes go to the persistent [`backend::Backend`] or, while buffering is
//! enabled, to the in-memory [`overlay::Overlay`]. Reads merge both, overlay
//! first. Three locks are involved, always taken in this order:
//!
//! 1. `gate`: shared by reads and updates, exclusive for `clear` and the
//!    buffering toggle, so a mode flip waits for in-flight updates.
//! 2. a per-file stripe lock serializing updates of the same file.
//! 3. `state`: the data itself, held only while applying or reading.

pub mod backend;
pub mod overlay;

use std::{
   collections::BTreeSet,
   path::{Path, PathBuf},
   sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use self::{backend::Backend, overlay::Overlay};
use crate::{
   error::StorageError,
   types::{FileId, IndexId, KeyValueMap, Value},
   util,
};

/// How much an update changed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DeltaStats {
   pub added:   usize,
   pub removed: usize,
}

impl DeltaStats {
   pub const fn is_empty(&self) -> bool {
      self.added == 0 && self.removed == 0
   }
}

struct StorageState {
   backend: Backend,
   overlay: Overlay,
}

pub struct IndexStorage {
   id:                IndexId,
   dir:               PathBuf,
   gate:              RwLock<()>,
   file_locks:        Box<[Mutex<()>]>,
   state:             RwLock<StorageState>,
   buffering:         AtomicBool,
   max_buffered_keys: usize,
   mod_count:         AtomicU64,
}

impl IndexStorage {
   pub fn open(
      id: IndexId,
      dir: &Path,
      keep_forward: bool,
      file_stripes: usize,
      max_buffered_keys: usize,
   ) -> Result<Self, StorageError> {
      let backend = Backend::open(dir, keep_forward)?;
      Ok(Self {
         id,
         dir: dir.to_path_buf(),
         gate: RwLock::new(()),
         file_locks: (0..file_stripes.max(1)).map(|_| Mutex::new(())).collect(),
         state: RwLock::new(StorageState { backend, overlay: Overlay::default() }),
         buffering: AtomicBool::new(false),
         max_buffered_keys,
         mod_count: AtomicU64::new(0),
      })
   }

   pub const fn id(&self) -> &IndexId {
      &self.id
   }

   pub fn dir(&self) -> &Path {
      &self.dir
   }

   fn file_lock(&self, file: FileId) -> MutexGuard<'_, ()> {
      let idx = file.live().raw().unsigned_abs() as usize % self.file_locks.len();
      self.file_locks[idx].lock()
   }

   fn touch(&self) {
      self.mod_count.fetch_add(1, Ordering::AcqRel);
   }

   pub fn mod_count(&self) -> u64 {
      self.mod_count.load(Ordering::Acquire)
   }

   /// Starts a serialized update of `file`. The session keeps the buffering
   /// mode fixed and excludes other updates of the same file until dropped.
   pub fn begin_update(&self, file: FileId) -> UpdateSession<'_> {
      let gate = self.gate.read();
      let file_guard = self.file_lock(file);
      UpdateSession { storage: self, file, _gate: gate, _file: file_guard }
   }

   pub fn add_value(&self, key: &str, file: FileId, value: Value) -> Result<(), StorageError> {
      let _gate = self.gate.read();
      let _file = self.file_lock(file);
      let mut state = self.state.write();
      if self.buffering.load(Ordering::Acquire) {
         let StorageState { backend, overlay } = &mut *state;
         overlay.add(file, key, value, || backend.data_of(file), self.max_buffered_keys)?;
      } else {
         state.backend.add(key, file, value.clone());
         let mut data = state.backend.data_of(file);
         data.insert(key.to_string(), value);
         state.backend.set_forward(file, data);
      }
      drop(state);
      self.touch();
      Ok(())
   }

   pub fn remove_all_values(&self, key: &str, file: FileId) -> Result<bool, StorageError> {
      let _gate = self.gate.read();
      let _file = self.file_lock(file);
      let mut state = self.state.write();
      let removed = if self.buffering.load(Ordering::Acquire) {
         let StorageState { backend, overlay } = &mut *state;
         overlay.remove(file, key, || backend.data_of(file), self.max_buffered_keys)?
      } else {
         let removed = state.backend.remove(key, file);
         let mut data = state.backend.data_of(file);
         data.remove(key);
         state.backend.set_forward(file, data);
         removed
      };
      drop(state);
      self.touch();
      Ok(removed)
   }

   /// Every (file, value) stored under `key`, buffered state first.
   pub fn read(&self, key: &str) -> Vec<(FileId, Value)> {
      let _gate = self.gate.read();
      let state = self.state.read();
      let mut out: Vec<(FileId, Value)> = state
         .backend
         .read(key)
         .into_iter()
         .flatten()
         .filter(|(file, _)| !state.overlay.contains_file(**file))
         .map(|(file, value)| (*file, value.clone()))
         .collect();
      if let Some(buffered) = state.overlay.read(key) {
         out.extend(buffered.iter().map(|(file, value)| (*file, value.clone())));
         out.sort_unstable_by_key(|(file, _)| *file);
      }
      out
   }

   pub fn files_with_key(&self, key: &str) -> BTreeSet<FileId> {
      self.read(key).into_iter().map(|(file, _)| file).collect()
   }

   /// Visits every key with at least one live posting. Stops when `visitor`
   /// returns `false`; the return value says whether the walk completed.
   pub fn process_keys(&self, mut visitor: impl FnMut(&str) -> bool) -> bool {
      let _gate = self.gate.read();
      let state = self.state.read();
      let overlay = &state.overlay;
      for (key, postings) in state.backend.keys() {
         let visible = overlay.read(key).is_some()
            || postings.keys().any(|file| !overlay.contains_file(*file));
         if visible && !visitor(key) {
            return false;
         }
      }
      for key in overlay.keys() {
         if state.backend.read(key).is_none() && !visitor(key) {
            return false;
         }
      }
      true
   }

   /// What `file` currently contributes to this index.
   pub fn indexed_data(&self, file: FileId) -> KeyValueMap {
      let _gate = self.gate.read();
      let state = self.state.read();
      state
         .overlay
         .data_of(file)
         .cloned()
         .unwrap_or_else(|| state.backend.data_of(file))
   }

   /// Files with stored or buffered data.
   pub fn indexed_files(&self) -> BTreeSet<FileId> {
      let _gate = self.gate.read();
      let state = self.state.read();
      let mut files = state.backend.files();
      files.extend(state.overlay.files());
      files
   }

   pub fn key_count(&self) -> usize {
      let state = self.state.read();
      let buffered_only = state
         .overlay
         .keys()
         .filter(|k| state.backend.read(k).is_none())
         .count();
      state.backend.key_count() + buffered_only
   }

   pub fn is_buffering(&self) -> bool {
      self.buffering.load(Ordering::Acquire)
   }

   /// Switches buffering mode once every in-flight update has finished.
   /// Disabling drops the overlay and returns the files it held.
   pub fn set_buffering_enabled(&self, enabled: bool) -> Vec<FileId> {
      let _gate = self.gate.write();
      let was = self.buffering.swap(enabled, Ordering::AcqRel);
      if was == enabled || enabled {
         return Vec::new();
      }
      let dropped = self.state.write().overlay.drain();
      if !dropped.is_empty() {
         self.touch();
      }
      dropped
   }

   /// Forgets buffered data for one file.
   pub fn drop_buffered(&self, file: FileId) -> bool {
      let _gate = self.gate.read();
      let _file = self.file_lock(file);
      let dropped = self.state.write().overlay.drop_file(file);
      if dropped {
         self.touch();
      }
      dropped
   }

   pub fn buffered_entries(&self) -> usize {
      self.state.read().overlay.entries()
   }

   /// Drops all data, buffered and persistent.
   pub fn clear(&self) -> Result<(), StorageError> {
      let _gate = self.gate.write();
      let mut state = self.state.write();
      state.overlay.drain();
      state.backend.clear()?;
      drop(state);
      self.touch();
      Ok(())
   }

   /// Forces the persistent backend to durable state. Buffered data is
   /// never written.
   pub fn flush(&self) -> Result<(), StorageError> {
      self.state.write().backend.flush()
   }
}

/// Exclusive right to update one file of one index.
pub struct UpdateSession<'a> {
   storage: &'a IndexStorage,
   file:    FileId,
   _gate:   RwLockReadGuard<'a, ()>,
   _file:   MutexGuard<'a, ()>,
}

impl UpdateSession<'_> {
   pub fn is_buffering(&self) -> bool {
      self.storage.buffering.load(Ordering::Acquire)
   }

   /// Data the file contributes right now, as seen in the current mode.
   pub fn previous(&self) -> KeyValueMap {
      let state = self.storage.state.read();
      if self.is_buffering()
         && let Some(data) = state.overlay.data_of(self.file)
      {
         return data.clone();
      }
      state.backend.data_of(self.file)
   }

   /// Makes `data` the file's complete contribution, touching only the
   /// (key, value) pairs that differ from what is stored.
   pub fn apply(&self, data: KeyValueMap) -> Result<DeltaStats, StorageError> {
      util::fail_point("storage.apply").map_err(|_| StorageError::Injected("storage.apply"))?;
      let storage = self.storage;
      let file = self.file;
      let mut state = storage.state.write();

      if self.is_buffering() {
         let previous = match state.overlay.data_of(file) {
            Some(data) => data.clone(),
            None => state.backend.data_of(file),
         };
         let stats = diff_stats(&previous, &data);
         state.overlay.replace(file, data, storage.max_buffered_keys)?;
         drop(state);
         storage.touch();
         return Ok(stats);
      }

      let previous = state.backend.data_of(file);
      let mut stats = DeltaStats::default();
      for (key, old) in &previous {
         if data.get(key) != Some(old) {
            state.backend.remove(key, file);
            stats.removed += 1;
         }
      }
      for (key, value) in &data {
         if previous.get(key) != Some(value) {
            state.backend.add(key, file, value.clone());
            stats.added += 1;
         }
      }
      if !stats.is_empty() {
         state.backend.set_forward(file, data);
         drop(state);
         storage.touch();
      }
      Ok(stats)
   }
}

fn diff_stats(previous: &KeyValueMap, next: &KeyValueMap) -> DeltaStats {
   DeltaStats {
      removed: previous.iter().filter(|(k, v)| next.get(*k) != Some(*v)).count(),
      added:   next.iter().filter(|(k, v)| previous.get(*k) != Some(*v)).count(),
   }
}
