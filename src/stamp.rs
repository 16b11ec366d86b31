//! Per-file, per-index freshness bookkeeping.
//!
//! Every (file, index) pair carries the creation stamp of the index
//! generation it was last indexed under. A stored stamp is only trusted while
//! it equals the index's current creation stamp; anything else reads as
//! [`Stamp::Outdated`]. Records live in memory, sharded over a fixed number
//! of striped locks, and are persisted as a whole by [`StampRegistry::persist`]
//! from a [`StampSnapshot`] taken *before* index storages are flushed.

use std::{
   collections::HashMap,
   fs,
   path::PathBuf,
   sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
   Result,
   types::{FileId, FileTimestamp, IndexId},
   util,
};

const STAMPS_MAGIC: [u8; 4] = *b"FBST";
const STAMPS_SCHEMA: u32 = 1;
const OUTDATED: u64 = 0;

/// Monotonic generation marker of an index's data.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct CreationStamp(u64);

impl CreationStamp {
   pub const fn from_raw(raw: u64) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u64 {
      self.0
   }
}

/// Hands out strictly increasing creation stamps, seeded from wall time.
#[derive(Debug, Default)]
pub struct CreationStampMinter {
   last: AtomicU64,
}

impl CreationStampMinter {
   /// Ensures future stamps are above `seen` (stamps loaded from disk).
   pub fn observe(&self, seen: CreationStamp) {
      self.last.fetch_max(seen.0, Ordering::AcqRel);
   }

   pub fn mint(&self) -> CreationStamp {
      let now = util::unix_millis();
      let prev = self
         .last
         .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| Some(now.max(prev + 1)))
         .unwrap_or_else(|prev| prev);
      CreationStamp(now.max(prev + 1))
   }
}

/// Freshness of one file for one index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stamp {
   NotIndexed,
   UpToDate(CreationStamp),
   Outdated,
}

impl Stamp {
   pub const fn is_up_to_date(self) -> bool {
      matches!(self, Self::UpToDate(_))
   }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StampEntry {
   index:  IndexId,
   stamp:  u64,
   failed: bool,
}

#[derive(Debug, Clone, Default)]
struct FileRecord {
   timestamp: Option<FileTimestamp>,
   entries:   SmallVec<[StampEntry; 4]>,
}

impl FileRecord {
   fn entry(&self, index: &IndexId) -> Option<&StampEntry> {
      self.entries.iter().find(|e| &e.index == index)
   }

   fn entry_mut(&mut self, index: &IndexId) -> &mut StampEntry {
      let pos = match self.entries.iter().position(|e| &e.index == index) {
         Some(pos) => pos,
         None => {
            self.entries.push(StampEntry { index: index.clone(), stamp: OUTDATED, failed: false });
            self.entries.len() - 1
         },
      };
      &mut self.entries[pos]
   }

   fn is_empty(&self) -> bool {
      self.timestamp.is_none() && self.entries.is_empty()
   }
}

#[derive(Default)]
struct Stripe {
   records: HashMap<FileId, FileRecord>,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedStamps {
   records: Vec<PersistedRecord>,
}

#[derive(Serialize, Deserialize)]
struct PersistedRecord {
   file:      FileId,
   timestamp: Option<FileTimestamp>,
   entries:   Vec<StampEntry>,
}

/// Point-in-time copy of every stamp, ready to be persisted.
pub struct StampSnapshot {
   body: PersistedStamps,
}

impl StampSnapshot {
   pub fn len(&self) -> usize {
      self.body.records.len()
   }

   pub fn is_empty(&self) -> bool {
      self.body.records.is_empty()
   }
}

pub struct StampRegistry {
   path:      PathBuf,
   stripes:   Box<[Mutex<Stripe>]>,
   current:   RwLock<HashMap<IndexId, CreationStamp>>,
   minter:    CreationStampMinter,
   mod_count: AtomicU64,
}

impl StampRegistry {
   /// Loads `path` if it exists. A file that fails its checksum is discarded,
   /// which leaves every file not indexed.
   pub fn open(path: impl Into<PathBuf>, stripes: usize) -> Result<Self> {
      let path = path.into();
      let stripes = (0..stripes.max(1)).map(|_| Mutex::new(Stripe::default())).collect();
      let registry = Self {
         path,
         stripes,
         current: RwLock::new(HashMap::new()),
         minter: CreationStampMinter::default(),
         mod_count: AtomicU64::new(0),
      };

      let bytes = match fs::read(&registry.path) {
         Ok(bytes) => bytes,
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
         Err(e) => return Err(e.into()),
      };
      let decoded = util::decode_framed::<PersistedStamps>(
         &registry.path,
         STAMPS_MAGIC,
         STAMPS_SCHEMA,
         &bytes,
      );
      match decoded {
         Ok(persisted) => {
            for record in persisted.records {
               for entry in &record.entries {
                  registry.minter.observe(CreationStamp(entry.stamp));
               }
               registry.stripe(record.file).lock().records.insert(record.file, FileRecord {
                  timestamp: record.timestamp,
                  entries:   record.entries.into(),
               });
            }
         },
         Err(e) => {
            tracing::warn!("discarding unreadable stamps at {}: {e}", registry.path.display());
            fs::remove_file(&registry.path)?;
         },
      }
      Ok(registry)
   }

   fn stripe(&self, file: FileId) -> &Mutex<Stripe> {
      let idx = file.live().raw().unsigned_abs() as usize % self.stripes.len();
      &self.stripes[idx]
   }

   fn touch(&self) {
      self.mod_count.fetch_add(1, Ordering::AcqRel);
   }

   pub fn minter(&self) -> &CreationStampMinter {
      &self.minter
   }

   /// Installs the generation stamp every stored stamp of `index` is compared to.
   pub fn set_current_creation_stamp(&self, index: &IndexId, stamp: CreationStamp) {
      self.minter.observe(stamp);
      self.current.write().insert(index.clone(), stamp);
      self.touch();
   }

   pub fn current_creation_stamp(&self, index: &IndexId) -> Option<CreationStamp> {
      self.current.read().get(index).copied()
   }

   pub fn get(&self, file: FileId, index: &IndexId) -> Stamp {
      let current = self.current_creation_stamp(index);
      let stripe = self.stripe(file).lock();
      let Some(entry) = stripe.records.get(&file).and_then(|r| r.entry(index)) else {
         return Stamp::NotIndexed;
      };
      match current {
         Some(cur) if entry.stamp == cur.0 => Stamp::UpToDate(cur),
         _ => Stamp::Outdated,
      }
   }

   pub fn mark_current(&self, file: FileId, index: &IndexId) {
      self.mark_current_with(file, index, false);
   }

   /// Marks the stamp current but remembers that extraction failed, so the
   /// file is skipped until [`Self::reset_failed`] or a new index generation.
   pub fn mark_failed(&self, file: FileId, index: &IndexId) {
      self.mark_current_with(file, index, true);
   }

   fn mark_current_with(&self, file: FileId, index: &IndexId, failed: bool) {
      let Some(current) = self.current_creation_stamp(index) else {
         tracing::warn!("stamp for {file} references unregistered index {index}");
         return;
      };
      self.mark_as(file, index, current, failed);
   }

   /// Records that `file` was indexed under `generation`, the creation stamp
   /// observed before its data was written. If the index has been cleared
   /// since, the stamp simply reads as outdated.
   pub fn mark_as(&self, file: FileId, index: &IndexId, generation: CreationStamp, failed: bool) {
      let mut stripe = self.stripe(file).lock();
      let entry = stripe.records.entry(file).or_default().entry_mut(index);
      entry.stamp = generation.0;
      entry.failed = failed;
      drop(stripe);
      self.touch();
   }

   pub fn mark_outdated(&self, file: FileId, index: &IndexId) {
      let mut stripe = self.stripe(file).lock();
      if let Some(record) = stripe.records.get_mut(&file)
         && let Some(pos) = record.entries.iter().position(|e| &e.index == index)
      {
         record.entries[pos].stamp = OUTDATED;
         record.entries[pos].failed = false;
         drop(stripe);
         self.touch();
      }
   }

   /// Outdates every index of `file` and forgets its recorded timestamp.
   pub fn mark_all_outdated(&self, file: FileId) {
      let mut stripe = self.stripe(file).lock();
      if let Some(record) = stripe.records.get_mut(&file) {
         record.timestamp = None;
         for entry in &mut record.entries {
            entry.stamp = OUTDATED;
            entry.failed = false;
         }
         drop(stripe);
         self.touch();
      }
   }

   /// Drops the stamp of one index for `file`, as after removing its data.
   pub fn clear(&self, file: FileId, index: &IndexId) {
      let mut stripe = self.stripe(file).lock();
      if let Some(record) = stripe.records.get_mut(&file) {
         record.entries.retain(|e| &e.index != index);
         if record.is_empty() {
            stripe.records.remove(&file);
         }
         drop(stripe);
         self.touch();
      }
   }

   /// Every index holding a non-default stamp for `file`.
   pub fn list_non_trivial(&self, file: FileId) -> Vec<IndexId> {
      let stripe = self.stripe(file).lock();
      stripe
         .records
         .get(&file)
         .map(|r| r.entries.iter().map(|e| e.index.clone()).collect())
         .unwrap_or_default()
   }

   pub fn is_failed(&self, file: FileId, index: &IndexId) -> bool {
      let current = self.current_creation_stamp(index);
      let stripe = self.stripe(file).lock();
      stripe
         .records
         .get(&file)
         .and_then(|r| r.entry(index))
         .is_some_and(|e| e.failed && current.is_some_and(|c| c.0 == e.stamp))
   }

   /// Clears failed flags for `file`; returns whether any were set.
   pub fn reset_failed(&self, file: FileId) -> bool {
      let mut stripe = self.stripe(file).lock();
      let Some(record) = stripe.records.get_mut(&file) else {
         return false;
      };
      let mut any = false;
      for entry in record.entries.iter_mut().filter(|e| e.failed) {
         entry.failed = false;
         entry.stamp = OUTDATED;
         any = true;
      }
      drop(stripe);
      if any {
         self.touch();
      }
      any
   }

   /// Forgets everything recorded for `file`.
   pub fn remove_file(&self, file: FileId) {
      if self.stripe(file).lock().records.remove(&file).is_some() {
         self.touch();
      }
   }

   pub fn set_timestamp(&self, file: FileId, timestamp: FileTimestamp) {
      self
         .stripe(file)
         .lock()
         .records
         .entry(file)
         .or_default()
         .timestamp = Some(timestamp);
      self.touch();
   }

   /// Whether the file changed since it was last fully indexed.
   pub fn is_modified(&self, file: FileId, timestamp: FileTimestamp) -> bool {
      let stripe = self.stripe(file).lock();
      stripe
         .records
         .get(&file)
         .and_then(|r| r.timestamp)
         .is_none_or(|t| t != timestamp)
   }

   /// All files with any recorded state.
   pub fn files(&self) -> Vec<FileId> {
      let mut out = Vec::new();
      for stripe in &self.stripes {
         out.extend(stripe.lock().records.keys().copied());
      }
      out.sort_unstable();
      out
   }

   /// Removes every stamp of an index that is no longer registered.
   pub fn purge_index(&self, index: &IndexId) {
      let mut touched = false;
      for stripe in &self.stripes {
         let mut stripe = stripe.lock();
         stripe.records.retain(|_, record| {
            let before = record.entries.len();
            record.entries.retain(|e| &e.index != index);
            touched |= before != record.entries.len();
            !record.is_empty()
         });
      }
      self.current.write().remove(index);
      if touched {
         self.touch();
      }
   }

   pub fn mod_count(&self) -> u64 {
      self.mod_count.load(Ordering::Acquire)
   }

   /// Copies the current state. Stripes are visited one at a time, so the
   /// snapshot never blocks writers of other stripes.
   pub fn snapshot(&self) -> StampSnapshot {
      let mut records = Vec::new();
      for stripe in &self.stripes {
         let stripe = stripe.lock();
         records.extend(stripe.records.iter().map(|(file, record)| PersistedRecord {
            file:      *file,
            timestamp: record.timestamp,
            entries:   record.entries.to_vec(),
         }));
      }
      records.sort_unstable_by_key(|r| r.file);
      StampSnapshot { body: PersistedStamps { records } }
   }

   pub fn persist(&self, snapshot: &StampSnapshot) -> Result<()> {
      let bytes = util::encode_framed(STAMPS_MAGIC, STAMPS_SCHEMA, &snapshot.body)?;
      util::write_atomic(&self.path, &bytes)?;
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;

   fn registry(dir: &TempDir) -> StampRegistry {
      let reg = StampRegistry::open(dir.path().join("stamps.bin"), 4).unwrap();
      reg.set_current_creation_stamp(&IndexId::new("a"), CreationStamp(10));
      reg.set_current_creation_stamp(&IndexId::new("b"), CreationStamp(20));
      reg
   }

   #[test]
   fn mint_is_strictly_increasing() {
      let minter = CreationStampMinter::default();
      minter.observe(CreationStamp(u64::MAX / 2));
      let a = minter.mint();
      let b = minter.mint();
      assert!(a.raw() > u64::MAX / 2);
      assert!(b > a);
   }

   #[test]
   fn new_generation_outdates_existing_stamps() {
      let dir = TempDir::new().unwrap();
      let reg = registry(&dir);
      let (a, b) = (IndexId::new("a"), IndexId::new("b"));
      let file = FileId::new(1);

      assert_eq!(reg.get(file, &a), Stamp::NotIndexed);
      reg.mark_current(file, &a);
      reg.mark_current(file, &b);
      assert_eq!(reg.get(file, &a), Stamp::UpToDate(CreationStamp(10)));

      reg.set_current_creation_stamp(&a, CreationStamp(11));
      assert_eq!(reg.get(file, &a), Stamp::Outdated);
      assert!(reg.get(file, &b).is_up_to_date());
      assert_eq!(reg.list_non_trivial(file).len(), 2);
   }

   #[test]
   fn marking_under_a_superseded_generation_reads_outdated() {
      let dir = TempDir::new().unwrap();
      let reg = registry(&dir);
      let a = IndexId::new("a");
      let file = FileId::new(3);
      let before = reg.current_creation_stamp(&a).unwrap();

      reg.set_current_creation_stamp(&a, CreationStamp(before.raw() + 1));
      reg.mark_as(file, &a, before, false);
      assert_eq!(reg.get(file, &a), Stamp::Outdated);
      assert_eq!(reg.list_non_trivial(file), vec![a]);
   }

   #[test]
   fn mark_outdated_touches_one_index_only() {
      let dir = TempDir::new().unwrap();
      let reg = registry(&dir);
      let (a, b) = (IndexId::new("a"), IndexId::new("b"));
      let file = FileId::new(2);
      reg.mark_current(file, &a);
      reg.mark_current(file, &b);

      reg.mark_outdated(file, &a);
      assert_eq!(reg.get(file, &a), Stamp::Outdated);
      assert!(reg.get(file, &b).is_up_to_date());
      assert_eq!(reg.list_non_trivial(file).len(), 2);
   }

   #[test]
   fn failed_flag_is_bound_to_generation() {
      let dir = TempDir::new().unwrap();
      let reg = registry(&dir);
      let a = IndexId::new("a");
      let file = FileId::new(3);

      reg.mark_failed(file, &a);
      assert!(reg.is_failed(file, &a));
      assert!(reg.get(file, &a).is_up_to_date());

      reg.set_current_creation_stamp(&a, CreationStamp(12));
      assert!(!reg.is_failed(file, &a));

      reg.set_current_creation_stamp(&a, CreationStamp(10));
      assert!(reg.reset_failed(file));
      assert!(!reg.is_failed(file, &a));
      assert_eq!(reg.get(file, &a), Stamp::Outdated);
   }

   #[test]
   fn only_persisted_snapshot_survives_reopen() {
      let dir = TempDir::new().unwrap();
      let a = IndexId::new("a");
      {
         let reg = registry(&dir);
         reg.mark_current(FileId::new(1), &a);
         reg.set_timestamp(FileId::new(1), FileTimestamp { modified_ms: 5, len: 9 });
         let snapshot = reg.snapshot();
         reg.mark_current(FileId::new(2), &a);
         reg.persist(&snapshot).unwrap();
      }
      let reg = registry(&dir);
      assert!(reg.get(FileId::new(1), &a).is_up_to_date());
      assert_eq!(reg.get(FileId::new(2), &a), Stamp::NotIndexed);
      assert!(!reg.is_modified(FileId::new(1), FileTimestamp { modified_ms: 5, len: 9 }));
      assert!(reg.is_modified(FileId::new(1), FileTimestamp { modified_ms: 6, len: 9 }));
   }

   #[test]
   fn corrupted_file_is_discarded() {
      let dir = TempDir::new().unwrap();
      fs::write(dir.path().join("stamps.bin"), b"garbage").unwrap();
      let reg = StampRegistry::open(dir.path().join("stamps.bin"), 2).unwrap();
      assert!(reg.files().is_empty());
      assert!(!dir.path().join("stamps.bin").exists());
   }

   #[test]
   fn purge_drops_index_and_empty_records() {
      let dir = TempDir::new().unwrap();
      let reg = registry(&dir);
      let a = IndexId::new("a");
      reg.mark_current(FileId::new(1), &a);
      reg.purge_index(&a);
      assert!(reg.files().is_empty());
      assert!(reg.current_creation_stamp(&a).is_none());
   }
}
