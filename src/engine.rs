//! The engine facade: startup, event intake, queries, flushing, shutdown.
//!
//! Layout of a data root:
//!
//! ```text
//! <root>/lock                 exclusive process lock
//! <root>/corruption.marker    present => wipe everything on next open
//! <root>/stamps.bin           persisted stamp registry
//! <root>/indices/registered.json
//! <root>/indices/<name>/{version.json,store.bin}
//! <root>/snapshots/<name>/v<version>/..
//! ```

use std::{
   collections::BTreeSet,
   fs, io,
   path::{Path, PathBuf},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   thread::{self, JoinHandle},
};

use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
   Error, Result,
   cancel::IndexingToken,
   config::Config,
   events::{ChangeEventMerger, ChangeKind},
   extension::IndexExtension,
   lock::DataLock,
   registry::{
      EffectiveVersion, IndexRegistry, RebuildState, RegisteredIndex, VersionDiff,
      version::VERSION_FILE,
   },
   scheduler::{IndexingProgressCallback, IndexingReport, ParallelIndexingScheduler},
   snapshot::{SnapshotCache, SnapshotStats},
   source::{FileSource, looks_binary},
   stamp::{Stamp, StampRegistry},
   tracker::ChangedFileTracker,
   types::{FileId, IndexId, Key, KeyValueMap, SearchScope, Value},
   update::{DigestMemo, FileContent, UpdateEngine, UpdateOutcome},
   util,
};

const CORRUPTION_MARKER: &str = "corruption.marker";
const STAMPS_FILE: &str = "stamps.bin";
const INDICES_DIR: &str = "indices";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Serialize, Debug, Clone)]
pub struct IndexStatus {
   pub name:           String,
   pub state:          RebuildState,
   pub version:        EffectiveVersion,
   pub creation_stamp: u64,
   pub keys:           usize,
   pub buffering:      bool,
   pub startup:        VersionDiff,
}

#[derive(Serialize, Debug, Clone)]
pub struct EngineStatus {
   pub data_root:     PathBuf,
   pub indices:       Vec<IndexStatus>,
   pub pending_files: usize,
   pub tracked_files: usize,
   pub snapshots:     SnapshotStats,
}

struct Daemon {
   stop:   Sender<()>,
   handle: JoinHandle<()>,
}

pub struct IndexEngine {
   root:         PathBuf,
   config:       Arc<Config>,
   source:       Arc<dyn FileSource>,
   stamps:       Arc<StampRegistry>,
   snapshots:    Arc<SnapshotCache>,
   registry:     Arc<IndexRegistry>,
   merger:       Arc<ChangeEventMerger>,
   updates:      Arc<UpdateEngine>,
   tracker:      Arc<ChangedFileTracker>,
   scheduler:    ParallelIndexingScheduler,
   diffs:        Vec<(IndexId, VersionDiff)>,
   flush_lock:   Mutex<()>,
   last_flushed: AtomicU64,
   shut_down:    AtomicBool,
   daemon:       Mutex<Option<Daemon>>,
   lock:         Mutex<Option<DataLock>>,
}

impl IndexEngine {
   /// Opens (or creates) the data root, reconciles every extension's stored
   /// state with its version, and queues whatever is not up to date.
   pub fn open(
      root: impl Into<PathBuf>,
      config: Arc<Config>,
      source: Arc<dyn FileSource>,
      extensions: Vec<Arc<dyn IndexExtension>>,
   ) -> Result<Arc<Self>> {
      config.validate()?;
      let root = root.into();
      let lock = DataLock::acquire(&root)?;

      let corrupted = root.join(CORRUPTION_MARKER).exists();
      if corrupted {
         tracing::warn!("{} is marked corrupted; wiping all index data", root.display());
         wipe_data(&root)?;
      }

      let stamps =
         Arc::new(StampRegistry::open(root.join(STAMPS_FILE), config.effective_stamp_stripes())?);
      let snapshots =
         Arc::new(SnapshotCache::open(root.join(SNAPSHOTS_DIR), config.snapshot_hot_entries)?);
      let registry = Arc::new(IndexRegistry::new(
         root.join(INDICES_DIR),
         Arc::clone(&stamps),
         Arc::clone(&snapshots),
         config.effective_file_stripes(),
         config.max_buffered_keys,
      )?);

      let generation = source.generation();
      let mut diffs = Vec::with_capacity(extensions.len());
      for extension in extensions {
         let id = IndexId::new(extension.name());
         let diff = match registry.register(extension, generation)? {
            VersionDiff::InitialBuild if corrupted => VersionDiff::CorruptedRebuild,
            diff => diff,
         };
         diffs.push((id, diff));
      }
      registry.save_registered_and_drop_unregistered()?;
      if corrupted {
         fs::remove_file(root.join(CORRUPTION_MARKER))?;
      }

      let merger = Arc::new(ChangeEventMerger::new());
      {
         let registry = Arc::clone(&registry);
         merger.add_invalidator(move |file| {
            for index in registry.all() {
               index.storage.drop_buffered(file.live());
            }
         });
      }
      let updates = Arc::new(UpdateEngine::new(
         Arc::clone(&registry),
         Arc::clone(&stamps),
         Arc::clone(&snapshots),
         Arc::clone(&source),
         config.effective_max_file_size_bytes(),
         config.strict_invariants,
      ));
      let tracker = Arc::new(ChangedFileTracker::new(
         Arc::clone(&merger),
         Arc::clone(&stamps),
         Arc::clone(&registry),
         Arc::clone(&updates),
         config.async_drain_threshold,
      ));

      let engine = Arc::new(Self {
         scheduler: ParallelIndexingScheduler::new(config.indexing_threads()),
         root,
         config,
         source,
         stamps,
         snapshots,
         registry,
         merger,
         updates,
         tracker,
         diffs,
         flush_lock: Mutex::new(()),
         last_flushed: AtomicU64::new(0),
         shut_down: AtomicBool::new(false),
         daemon: Mutex::new(None),
         lock: Mutex::new(Some(lock)),
      });
      engine.last_flushed.store(engine.modification_count(), Ordering::Release);

      let queued = engine.scan()?;
      tracing::info!("opened {} ({queued} files queued)", engine.root.display());

      if engine.config.background_maintenance {
         let daemon = Self::spawn_daemon(&engine)?;
         *engine.daemon.lock() = Some(daemon);
      }
      Ok(engine)
   }

   fn spawn_daemon(engine: &Arc<Self>) -> Result<Daemon> {
      let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
      let weak: Weak<Self> = Arc::downgrade(engine);
      let ticker = crossbeam_channel::tick(engine.config.flush_interval());
      let handle = thread::Builder::new()
         .name("fbidx-maintenance".into())
         .spawn(move || {
            loop {
               select! {
                  recv(stopped) -> _ => break,
                  recv(ticker) -> _ => {
                     let Some(engine) = weak.upgrade() else { break };
                     engine.maintenance_tick();
                  },
               }
            }
         })?;
      Ok(Daemon { stop, handle })
   }

   fn maintenance_tick(&self) {
      if !self.registry.pending_rebuilds().is_empty()
         && let Err(e) = self.run_pending_rebuilds()
      {
         tracing::warn!("background rebuild failed: {e}");
      }
      if let Err(e) = self.flush_if_modified() {
         tracing::warn!("periodic flush failed: {e}");
      }
   }

   fn check_open(&self) -> Result<()> {
      if self.shut_down.load(Ordering::Acquire) { Err(Error::ShutDown) } else { Ok(()) }
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   pub fn config(&self) -> &Config {
      &self.config
   }

   pub fn source(&self) -> &Arc<dyn FileSource> {
      &self.source
   }

   pub fn registry(&self) -> &Arc<IndexRegistry> {
      &self.registry
   }

   pub fn stamps(&self) -> &Arc<StampRegistry> {
      &self.stamps
   }

   pub fn snapshots(&self) -> &Arc<SnapshotCache> {
      &self.snapshots
   }

   pub fn tracker(&self) -> &Arc<ChangedFileTracker> {
      &self.tracker
   }

   /// What registration found for each index at open.
   pub fn diffs(&self) -> &[(IndexId, VersionDiff)] {
      &self.diffs
   }

   pub fn stamp(&self, file: FileId, index: &str) -> Result<Stamp> {
      let index = self.registry.get(index)?;
      Ok(self.stamps.get(file.live(), &index.id))
   }

   fn ready_index(&self, index: &str) -> Result<Arc<RegisteredIndex>> {
      self.check_open()?;
      let registered = self.registry.get(index)?;
      registered.ensure_ready()?;
      Ok(registered)
   }

   // Event intake

   pub fn record_event(self: &Arc<Self>, file: FileId, kind: ChangeKind) -> Result<()> {
      self.check_open()?;
      self.merger.record(file, kind);
      if self.config.background_maintenance {
         self.tracker.maybe_drain_async();
      }
      Ok(())
   }

   /// Invalidates transient state of `file` before its bytes change.
   pub fn before_content_change(&self, file: FileId) -> Result<()> {
      self.check_open()?;
      self.merger.before_content_change(file);
      Ok(())
   }

   /// Compares the file source against recorded stamps and queues every
   /// file that is new, modified, outdated for some index, or gone.
   pub fn scan(&self) -> Result<usize> {
      self.check_open()?;
      let live: BTreeSet<FileId> = self.source.files()?.into_iter().map(FileId::live).collect();
      let mut queued = 0;
      for &file in &live {
         let Some(meta) = self.source.metadata(file)? else {
            continue;
         };
         if self.updates.needs_indexing(file, &meta) {
            self.tracker.schedule_for_update(file);
            queued += 1;
         }
      }

      let mut known: BTreeSet<FileId> = self.stamps.files().into_iter().collect();
      for index in self.registry.all() {
         known.extend(index.storage.indexed_files());
      }
      for file in known.difference(&live) {
         self.tracker.schedule_removal(*file);
         queued += 1;
      }
      Ok(queued)
   }

   /// Indexes every pending file on the worker pool.
   pub fn index_all(
      &self,
      token: &IndexingToken,
      callback: &mut dyn IndexingProgressCallback,
   ) -> Result<IndexingReport> {
      self.check_open()?;
      let files = self.tracker.claim_all();
      self.scheduler.run(&self.tracker, &files, token, callback)
   }

   pub fn ensure_up_to_date(&self, index: &str, scope: &SearchScope) -> Result<()> {
      self.check_open()?;
      self.tracker.ensure_up_to_date(index, scope)
   }

   pub fn ensure_up_to_date_async(&self) -> Result<()> {
      self.check_open()?;
      self.tracker.ensure_up_to_date_async();
      Ok(())
   }

   // Queries

   fn fresh_index(&self, index: &str, scope: &SearchScope) -> Result<Arc<RegisteredIndex>> {
      let registered = self.ready_index(index)?;
      self.tracker.ensure_up_to_date(index, scope)?;
      Ok(registered)
   }

   pub fn get_values(&self, index: &str, key: &str, scope: &SearchScope) -> Result<Vec<Value>> {
      let registered = self.fresh_index(index, scope)?;
      Ok(registered
         .storage
         .read(key)
         .into_iter()
         .filter(|(file, _)| scope.contains(*file))
         .map(|(_, value)| value)
         .collect())
   }

   pub fn get_files_with_key(
      &self,
      index: &str,
      key: &str,
      scope: &SearchScope,
   ) -> Result<BTreeSet<FileId>> {
      let registered = self.fresh_index(index, scope)?;
      let mut files = registered.storage.files_with_key(key);
      files.retain(|file| scope.contains(*file));
      Ok(files)
   }

   /// Files carrying every one of `keys`. No keys yields no files.
   pub fn get_files_containing_all_keys(
      &self,
      index: &str,
      keys: &[&str],
      scope: &SearchScope,
   ) -> Result<BTreeSet<FileId>> {
      let registered = self.fresh_index(index, scope)?;
      let mut result: Option<BTreeSet<FileId>> = None;
      for key in keys {
         let mut files = registered.storage.files_with_key(key);
         files.retain(|file| scope.contains(*file));
         let next = match result {
            Some(acc) => acc.intersection(&files).copied().collect(),
            None => files,
         };
         if next.is_empty() {
            return Ok(next);
         }
         result = Some(next);
      }
      Ok(result.unwrap_or_default())
   }

   pub fn get_file_data(&self, index: &str, file: FileId) -> Result<KeyValueMap> {
      let registered = self.fresh_index(index, &SearchScope::files([file]))?;
      Ok(registered.storage.indexed_data(file.live()))
   }

   pub fn all_keys(&self, index: &str, scope: &SearchScope) -> Result<Vec<Key>> {
      let registered = self.fresh_index(index, scope)?;
      let mut keys = Vec::new();
      registered.storage.process_keys(|key| {
         keys.push(key.to_string());
         true
      });
      if let SearchScope::Files(_) = scope {
         keys.retain(|key| {
            registered
               .storage
               .read(key)
               .iter()
               .any(|(file, _)| scope.contains(*file))
         });
      }
      keys.sort_unstable();
      Ok(keys)
   }

   /// Visits keys until `visitor` returns `false`; returns whether every key
   /// was visited.
   pub fn process_all_keys(
      &self,
      index: &str,
      scope: &SearchScope,
      mut visitor: impl FnMut(&str) -> bool,
   ) -> Result<bool> {
      if let SearchScope::Everything = scope {
         let registered = self.fresh_index(index, scope)?;
         return Ok(registered.storage.process_keys(visitor));
      }
      let keys = self.all_keys(index, scope)?;
      Ok(keys.iter().all(|key| visitor(key)))
   }

   // Unsaved content

   pub fn set_buffering_enabled(&self, index: &str, enabled: bool) -> Result<()> {
      let registered = self.ready_index(index)?;
      let dropped = registered.storage.set_buffering_enabled(enabled);
      for file in dropped {
         self.tracker.schedule_for_update(file);
      }
      Ok(())
   }

   /// Indexes `bytes` as the unsaved content of `file` into the overlay of
   /// `index`. Nothing reaches the persistent backend or the stamps.
   pub fn index_unsaved_content(&self, index: &str, file: FileId, bytes: &[u8]) -> Result<()> {
      let registered = self.ready_index(index)?;
      if !registered.storage.is_buffering() {
         return Err(Error::BufferingDisabled(registered.id.clone()));
      }
      let file = file.live();
      let mut meta = self.source.metadata(file)?.ok_or(Error::UnknownFile(file))?;
      meta.timestamp.len = bytes.len() as u64;
      meta.is_binary = looks_binary(bytes);
      let content = (meta.len() <= self.config.effective_max_file_size_bytes()).then_some(bytes);

      let input = FileContent::Present { meta: &meta, content };
      match self.updates.update(file, &registered, input, &mut DigestMemo::default())? {
         UpdateOutcome::Buffered(_) => Ok(()),
         outcome => Err(Error::Invariant(format!("unsaved update was not buffered: {outcome:?}"))),
      }
   }

   /// Forgets unsaved content of `file` in every index.
   pub fn discard_unsaved(&self, file: FileId) -> bool {
      let mut any = false;
      for index in self.registry.all() {
         any |= index.storage.drop_buffered(file.live());
      }
      any
   }

   // Failures and rebuilds

   pub fn reset_failed(&self, file: FileId) -> Result<bool> {
      self.check_open()?;
      let reset = self.stamps.reset_failed(file.live());
      if reset {
         self.tracker.schedule_for_update(file);
      }
      Ok(reset)
   }

   pub fn request_rebuild(&self, index: &str, cause: &str) -> Result<bool> {
      self.check_open()?;
      let registered = self.registry.get(index)?;
      Ok(self.registry.request_rebuild(&registered.id, cause))
   }

   /// Runs every requested rebuild and queues all files for the rebuilt
   /// indices. Returns the indices that were rebuilt.
   pub fn run_pending_rebuilds(&self) -> Result<Vec<IndexId>> {
      self.check_open()?;
      let mut wanted: BTreeSet<IndexId> =
         self.registry.take_requests().into_iter().map(|r| r.index).collect();
      wanted.extend(self.registry.pending_rebuilds());

      let mut rebuilt = Vec::new();
      for id in wanted {
         let retries = self.config.rebuild_max_retries;
         if self.registry.run_rebuild(&id, retries, self.config.rebuild_backoff())? {
            rebuilt.push(id);
         }
      }
      if !rebuilt.is_empty() {
         for file in self.source.files()? {
            self.tracker.schedule_for_update(file);
         }
      }
      Ok(rebuilt)
   }

   /// Declares the data root corrupted; the next open starts from scratch.
   pub fn mark_corrupted(&self) -> Result<()> {
      util::write_atomic(&self.root.join(CORRUPTION_MARKER), b"corrupted\n")?;
      self.registry.invalidate_all_markers()
   }

   // Durability

   fn modification_count(&self) -> u64 {
      self
         .registry
         .all()
         .iter()
         .map(|index| index.storage.mod_count())
         .fold(self.stamps.mod_count(), u64::wrapping_add)
   }

   pub fn flush_if_modified(&self) -> Result<bool> {
      if self.modification_count() == self.last_flushed.load(Ordering::Acquire) {
         return Ok(false);
      }
      self.flush()?;
      Ok(true)
   }

   /// Makes the current state durable: stamps are snapshotted first, then
   /// every storage is flushed, then the snapshot is persisted. A persisted
   /// up-to-date stamp therefore never refers to unflushed data.
   pub fn flush(&self) -> Result<()> {
      let _guard = self.flush_lock.lock();
      util::fail_point("flush.before_storage")?;
      let count = self.modification_count();
      let snapshot = self.stamps.snapshot();

      let mut first_err = None;
      for index in self.registry.all() {
         if let Err(source) = index.storage.flush() {
            self.registry.request_rebuild(&index.id, source.to_string());
            first_err.get_or_insert(Error::storage(index.id.clone(), source));
         }
      }
      if let Some(err) = first_err {
         return Err(err);
      }

      self.source.persist()?;
      util::fail_point("flush.before_stamps")?;
      self.stamps.persist(&snapshot)?;
      self.last_flushed.store(count, Ordering::Release);
      tracing::debug!("flushed {} stamps", snapshot.len());
      Ok(())
   }

   /// Stops background work, purges tombstoned files, clears indices that
   /// are not ready, flushes, and releases the data root. Idempotent.
   pub fn shutdown(&self) -> Result<()> {
      if self
         .shut_down
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_err()
      {
         return Ok(());
      }
      if let Some(daemon) = self.daemon.lock().take() {
         let _ = daemon.stop.send(());
         let _ = daemon.handle.join();
      }
      self.tracker.stop_async();

      for tombstone in self.tracker.pending_tombstones() {
         if let Err(e) = self.updates.remove_file(tombstone.live()) {
            tracing::warn!("failed to purge {tombstone} on shutdown: {e}");
         }
      }
      for index in self.registry.all() {
         if index.rebuild.get() == RebuildState::Ok {
            continue;
         }
         tracing::info!("clearing {} on shutdown ({})", index.id, index.rebuild.get());
         index
            .storage
            .clear()
            .map_err(|e| Error::storage(index.id.clone(), e))?;
         remove_if_exists(&index.storage.dir().join(VERSION_FILE))?;
      }

      let flushed = self.flush();
      self.lock.lock().take();
      tracing::info!("shut down {}", self.root.display());
      flushed
   }

   pub fn is_shut_down(&self) -> bool {
      self.shut_down.load(Ordering::Acquire)
   }

   pub fn status(&self) -> EngineStatus {
      let indices = self
         .registry
         .all()
         .into_iter()
         .map(|index| IndexStatus {
            name:           index.id.to_string(),
            state:          index.rebuild.get(),
            version:        index.version(),
            creation_stamp: index.creation_stamp().raw(),
            keys:           index.storage.key_count(),
            buffering:      index.storage.is_buffering(),
            startup:        self
               .diffs
               .iter()
               .find(|(id, _)| *id == index.id)
               .map_or(VersionDiff::UpToDate, |(_, diff)| *diff),
         })
         .collect();
      EngineStatus {
         data_root: self.root.clone(),
         indices,
         pending_files: self.tracker.pending_count(),
         tracked_files: self.stamps.files().len(),
         snapshots: self.snapshots.stats(),
      }
   }
}

impl Drop for IndexEngine {
   fn drop(&mut self) {
      if let Some(daemon) = self.daemon.get_mut().take() {
         let _ = daemon.stop.send(());
      }
      self.tracker.stop_async();
   }
}

fn remove_if_exists(path: &Path) -> Result<()> {
   match fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
   }
}

fn wipe_data(root: &Path) -> Result<()> {
   remove_if_exists(&root.join(STAMPS_FILE))?;
   for dir in [INDICES_DIR, SNAPSHOTS_DIR] {
      match fs::remove_dir_all(root.join(dir)) {
         Ok(()) => {},
         Err(e) if e.kind() == io::ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }
   }
   Ok(())
}
