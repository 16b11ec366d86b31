//! Registered indices, their versions, and their rebuild lifecycle.
//!
//! Each index owns a directory `<indices>/<name>/` holding its storage and a
//! `version.json` marker. Registration compares the marker against the
//! effective version and wipes the directory whenever they disagree, so a
//! fresh creation stamp always comes with empty storage.

pub mod rebuild;
pub mod version;

use std::{
   collections::{BTreeSet, HashMap},
   fs, io,
   path::{Path, PathBuf},
   sync::Arc,
   thread,
   time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

pub use self::{
   rebuild::{RebuildState, RebuildStatus},
   version::{EffectiveVersion, FORMAT_VERSION, VersionDiff, VersionFile},
};
use crate::{
   Error, Result,
   extension::{self, IndexExtension},
   snapshot::SnapshotCache,
   source::FileMetadata,
   stamp::{CreationStamp, StampRegistry},
   storage::IndexStorage,
   types::IndexId,
   util,
};

const REGISTERED_FILE: &str = "registered.json";

pub struct RegisteredIndex {
   pub id:        IndexId,
   pub extension: Arc<dyn IndexExtension>,
   pub storage:   IndexStorage,
   pub rebuild:   RebuildStatus,
   version:       RwLock<EffectiveVersion>,
   stamp:         RwLock<CreationStamp>,
}

impl RegisteredIndex {
   pub fn version(&self) -> EffectiveVersion {
      *self.version.read()
   }

   pub fn creation_stamp(&self) -> CreationStamp {
      *self.stamp.read()
   }

   /// Fails with [`Error::NotReady`] unless the rebuild state is `Ok`.
   pub fn ensure_ready(&self) -> Result<()> {
      match self.rebuild.get() {
         RebuildState::Ok => Ok(()),
         state => Err(Error::NotReady { index: self.id.clone(), state }),
      }
   }

   /// Whether `meta` can contribute anything to this index.
   pub fn accepts(&self, meta: &FileMetadata) -> bool {
      self.extension.accepts(meta)
   }
}

/// Why a rebuild was requested.
#[derive(Debug, Clone)]
pub struct RebuildRequest {
   pub index: IndexId,
   pub cause: String,
}

pub struct IndexRegistry {
   root:      PathBuf,
   indices:   RwLock<HashMap<IndexId, Arc<RegisteredIndex>>>,
   order:     RwLock<Vec<IndexId>>,
   stamps:    Arc<StampRegistry>,
   snapshots: Arc<SnapshotCache>,
   stripes:   usize,
   buffered:  usize,
   requests:  (Sender<RebuildRequest>, Receiver<RebuildRequest>),
}

impl IndexRegistry {
   pub fn new(
      root: impl Into<PathBuf>,
      stamps: Arc<StampRegistry>,
      snapshots: Arc<SnapshotCache>,
      file_stripes: usize,
      max_buffered_keys: usize,
   ) -> Result<Self> {
      let root = root.into();
      fs::create_dir_all(&root)?;
      Ok(Self {
         root,
         indices: RwLock::new(HashMap::new()),
         order: RwLock::new(Vec::new()),
         stamps,
         snapshots,
         stripes: file_stripes,
         buffered: max_buffered_keys,
         requests: crossbeam_channel::unbounded(),
      })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   fn dir_of(&self, id: &IndexId) -> PathBuf {
      self.root.join(id.as_str())
   }

   /// Registers an extension and reconciles its on-disk state. Returns what
   /// had to happen to bring the index in line with its effective version.
   pub fn register(
      &self,
      extension: Arc<dyn IndexExtension>,
      source_generation: u64,
   ) -> Result<VersionDiff> {
      let name = extension.name();
      if !extension::is_valid_name(name) {
         return Err(Error::UnknownIndex(format!("invalid index name {name:?}")));
      }
      let id = IndexId::new(name);
      if self.indices.read().contains_key(&id) {
         return Err(Error::DuplicateIndex(id));
      }

      let dir = self.dir_of(&id);
      let current = EffectiveVersion {
         declared:   extension.version(),
         format:     FORMAT_VERSION,
         generation: source_generation,
      };
      let previous = VersionFile::load(&dir);
      let old_stamp = previous.as_ref().ok().and_then(|p| p.as_ref().map(|f| f.creation_stamp));
      let mut diff = VersionDiff::compute(previous, current);

      let keep_forward = extension.keeps_forward_index();
      let storage = if diff.requires_rebuild() {
         self.reset_dir(&dir)?;
         IndexStorage::open(id.clone(), &dir, keep_forward, self.stripes, self.buffered)
            .map_err(|e| Error::storage(id.clone(), e))?
      } else {
         match IndexStorage::open(id.clone(), &dir, keep_forward, self.stripes, self.buffered) {
            Ok(storage) => storage,
            Err(e) => {
               tracing::warn!("index {id} failed to open, rebuilding: {e}");
               diff = VersionDiff::CorruptedRebuild;
               self.reset_dir(&dir)?;
               IndexStorage::open(id.clone(), &dir, keep_forward, self.stripes, self.buffered)
                  .map_err(|e| Error::storage(id.clone(), e))?
            },
         }
      };

      let stamp = match (diff, old_stamp) {
         (VersionDiff::UpToDate, Some(stamp)) => stamp,
         _ => {
            let stamp = self.stamps.minter().mint();
            VersionFile::new(current, stamp).save(&dir)?;
            stamp
         },
      };
      if let VersionDiff::VersionChanged { old, new } = diff
         && old.declared != new.declared
      {
         self.snapshots.retain_version(&id, new.declared)?;
      }
      self.stamps.set_current_creation_stamp(&id, stamp);

      if diff != VersionDiff::UpToDate {
         tracing::info!("index {id}: {diff}");
      }

      let registered = Arc::new(RegisteredIndex {
         id: id.clone(),
         extension,
         storage,
         rebuild: RebuildStatus::default(),
         version: RwLock::new(current),
         stamp: RwLock::new(stamp),
      });
      self.indices.write().insert(id.clone(), registered);
      self.order.write().push(id);
      Ok(diff)
   }

   fn reset_dir(&self, dir: &Path) -> Result<()> {
      remove_dir_if_exists(dir)?;
      fs::create_dir_all(dir)?;
      Ok(())
   }

   pub fn get(&self, name: &str) -> Result<Arc<RegisteredIndex>> {
      self
         .indices
         .read()
         .get(name)
         .cloned()
         .ok_or_else(|| Error::UnknownIndex(name.to_string()))
   }

   /// Every registered index, in registration order.
   pub fn all(&self) -> Vec<Arc<RegisteredIndex>> {
      let indices = self.indices.read();
      self
         .order
         .read()
         .iter()
         .filter_map(|id| indices.get(id).cloned())
         .collect()
   }

   pub fn ids(&self) -> Vec<IndexId> {
      self.order.read().clone()
   }

   /// Moves `index` to `RequiresRebuild`. Only the caller that wins the
   /// transition enqueues a request; everyone else gets `false`.
   pub fn request_rebuild(&self, index: &IndexId, cause: impl Into<String>) -> bool {
      let Ok(registered) = self.get(index.as_str()) else {
         return false;
      };
      if !registered.rebuild.request() {
         return false;
      }
      let cause = cause.into();
      tracing::warn!("index {index} requires rebuild: {cause}");
      let _ = self.requests.0.send(RebuildRequest { index: index.clone(), cause });
      true
   }

   /// Pops every queued rebuild request.
   pub fn take_requests(&self) -> Vec<RebuildRequest> {
      self.requests.1.try_iter().collect()
   }

   pub fn pending_rebuilds(&self) -> Vec<IndexId> {
      self
         .all()
         .into_iter()
         .filter(|i| i.rebuild.get() == RebuildState::RequiresRebuild)
         .map(|i| i.id.clone())
         .collect()
   }

   /// Clears `index` and installs a new generation. Returns `Ok(false)` if
   /// another caller owns the rebuild or none was requested. On repeated
   /// failure the index returns to `RequiresRebuild`.
   pub fn run_rebuild(&self, index: &IndexId, retries: u32, backoff: Duration) -> Result<bool> {
      let registered = self.get(index.as_str())?;
      if !registered.rebuild.begin() {
         return Ok(false);
      }

      let mut attempt = 0;
      loop {
         match self.clear_generation(&registered) {
            Ok(()) => break,
            Err(e) if attempt < retries => {
               attempt += 1;
               tracing::warn!("rebuild of {index} failed (attempt {attempt}): {e}");
               thread::sleep(backoff.saturating_mul(1 << (attempt - 1).min(16)));
            },
            Err(e) => {
               registered.rebuild.abandon();
               return Err(e);
            },
         }
      }

      registered.rebuild.finish();
      tracing::info!("index {index} rebuilt at {}", registered.creation_stamp().raw());
      Ok(true)
   }

   fn clear_generation(&self, registered: &RegisteredIndex) -> Result<()> {
      util::fail_point("rebuild.before_clear")?;
      registered
         .storage
         .clear()
         .map_err(|e| Error::storage(registered.id.clone(), e))?;
      let stamp = self.stamps.minter().mint();
      let version = registered.version();
      VersionFile::new(version, stamp).save(registered.storage.dir())?;
      *registered.stamp.write() = stamp;
      self.stamps.set_current_creation_stamp(&registered.id, stamp);
      Ok(())
   }

   /// Deletes the version marker of every index so the next start rebuilds
   /// them all. Used when the whole data directory is declared corrupted.
   pub fn invalidate_all_markers(&self) -> Result<()> {
      for index in self.all() {
         match fs::remove_file(index.storage.dir().join(version::VERSION_FILE)) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
         }
      }
      Ok(())
   }

   /// Persists the set of registered names and deletes the state of every
   /// index that existed on disk but was not registered this run.
   pub fn save_registered_and_drop_unregistered(&self) -> Result<Vec<String>> {
      let registered: BTreeSet<String> =
         self.ids().iter().map(|id| id.as_str().to_string()).collect();

      let mut known: BTreeSet<String> = match fs::read(self.root.join(REGISTERED_FILE)) {
         Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!("ignoring unreadable {REGISTERED_FILE}: {e}");
            BTreeSet::new()
         }),
         Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
         Err(e) => return Err(e.into()),
      };
      for entry in fs::read_dir(&self.root)? {
         let entry = entry?;
         if entry.file_type()?.is_dir() {
            known.insert(entry.file_name().to_string_lossy().into_owned());
         }
      }
      known.extend(self.snapshots.indices_on_disk()?);

      let mut dropped = Vec::new();
      for name in known.difference(&registered) {
         let id = IndexId::new(name.as_str());
         remove_dir_if_exists(&self.dir_of(&id))?;
         self.snapshots.drop_index(&id)?;
         self.stamps.purge_index(&id);
         tracing::info!("dropped unregistered index {name}");
         dropped.push(name.clone());
      }

      let data = serde_json::to_vec_pretty(&registered)?;
      util::write_atomic(&self.root.join(REGISTERED_FILE), &data)?;
      Ok(dropped)
   }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
   match fs::remove_dir_all(dir) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
   }
}
