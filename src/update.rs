//! Per-file, per-index update: content to key/value map to minimal delta.
//!
//! Extraction (or a snapshot-cache hit) happens before the storage session
//! is opened, so only the diff and apply run under the per-file lock. The
//! stamp is marked current strictly after the storage accepted the delta,
//! and only for the index generation observed before the delta was applied.

use std::{cell::Cell, collections::HashMap, sync::Arc};

use crate::{
   Error, Result,
   cancel::IndexingToken,
   error::StorageError,
   extension::{ExtractError, IndexInput},
   registry::{IndexRegistry, RegisteredIndex},
   snapshot::{ContentDigest, DigestFlavor, SnapshotCache},
   source::{FileMetadata, FileSource},
   stamp::StampRegistry,
   storage::DeltaStats,
   types::{FileId, KeyValueMap},
   util,
};

thread_local! {
   static IN_UPDATE: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside [`UpdateEngine::update`].
pub fn in_update() -> bool {
   IN_UPDATE.with(Cell::get)
}

/// What the update sees for one file.
#[derive(Clone, Copy)]
pub enum FileContent<'a> {
   Deleted,
   /// `content` is `None` for files above the size limit or when no
   /// content-dependent index needs bytes.
   Present { meta: &'a FileMetadata, content: Option<&'a [u8]> },
}

/// Digests already computed for the current file, one per flavor.
#[derive(Default)]
pub struct DigestMemo {
   digests: HashMap<DigestFlavor, ContentDigest>,
}

impl DigestMemo {
   fn get(&mut self, flavor: DigestFlavor, meta: &FileMetadata, bytes: &[u8]) -> ContentDigest {
      *self
         .digests
         .entry(flavor)
         .or_insert_with(|| flavor.digest(meta, bytes))
   }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
   Applied(DeltaStats),
   /// Buffered in the overlay; the stamp is left alone.
   Buffered(DeltaStats),
   /// Extraction failed; data removed and the file marked failed.
   ContentFailed,
   /// The file is marked failed for this index generation.
   SkippedFailed,
}

/// Result of bringing every index up to date for one file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileOutcome {
   Indexed { indices: usize, failed: usize },
   Removed,
   Unchanged,
}

struct ReentrancyGuard;

impl ReentrancyGuard {
   fn enter(strict: bool) -> Result<Option<Self>> {
      if IN_UPDATE.with(|flag| flag.replace(true)) {
         let msg = "nested index update on one thread";
         if strict {
            return Err(Error::Invariant(msg.to_string()));
         }
         tracing::warn!("{msg}; continuing");
         return Ok(None);
      }
      Ok(Some(Self))
   }
}

impl Drop for ReentrancyGuard {
   fn drop(&mut self) {
      IN_UPDATE.with(|flag| flag.set(false));
   }
}

pub struct UpdateEngine {
   registry:      Arc<IndexRegistry>,
   stamps:        Arc<StampRegistry>,
   snapshots:     Arc<SnapshotCache>,
   source:        Arc<dyn FileSource>,
   max_file_size: u64,
   strict:        bool,
}

impl UpdateEngine {
   pub fn new(
      registry: Arc<IndexRegistry>,
      stamps: Arc<StampRegistry>,
      snapshots: Arc<SnapshotCache>,
      source: Arc<dyn FileSource>,
      max_file_size: u64,
      strict: bool,
   ) -> Self {
      Self { registry, stamps, snapshots, source, max_file_size, strict }
   }

   pub fn source(&self) -> &Arc<dyn FileSource> {
      &self.source
   }

   /// Brings `index`'s data for `file` in line with `input`.
   ///
   /// Storage failures put the index into `RequiresRebuild` (except an
   /// overflowing overlay, which is the caller's problem) and are returned.
   pub fn update(
      &self,
      file: FileId,
      index: &RegisteredIndex,
      input: FileContent<'_>,
      memo: &mut DigestMemo,
   ) -> Result<UpdateOutcome> {
      let _guard = ReentrancyGuard::enter(self.strict)?;
      index.ensure_ready()?;
      let file = file.live();

      let (data, content_failed) = match input {
         FileContent::Deleted => (KeyValueMap::new(), false),
         FileContent::Present { meta, .. } if !index.accepts(meta) => (KeyValueMap::new(), false),
         FileContent::Present { .. } if self.stamps.is_failed(file, &index.id) => {
            return Ok(UpdateOutcome::SkippedFailed);
         },
         FileContent::Present { meta, content } => match self.compute(index, meta, content, memo) {
            Ok(data) => (data, false),
            Err(e) => {
               let err = Error::Content { file, index: index.id.clone(), message: e.to_string() };
               tracing::warn!("{err}");
               (KeyValueMap::new(), true)
            },
         },
      };

      // Stamps written below refer to the generation the data went into.
      let generation = index.creation_stamp();
      let session = index.storage.begin_update(file);
      let buffering = session.is_buffering();
      let stats = match session.apply(data) {
         Ok(stats) => stats,
         Err(source) => {
            let overflow = matches!(source, StorageError::BufferOverflow { .. });
            drop(session);
            if !overflow {
               self.registry.request_rebuild(&index.id, source.to_string());
            }
            return Err(Error::storage(index.id.clone(), source));
         },
      };
      drop(session);

      if buffering {
         return Ok(UpdateOutcome::Buffered(stats));
      }
      util::fail_point("update.before_mark")?;
      match input {
         FileContent::Deleted => self.stamps.clear(file, &index.id),
         FileContent::Present { meta, .. } if !index.accepts(meta) => {
            self.stamps.clear(file, &index.id);
         },
         FileContent::Present { .. } if content_failed => {
            self.stamps.mark_as(file, &index.id, generation, true);
            return Ok(UpdateOutcome::ContentFailed);
         },
         FileContent::Present { .. } => self.stamps.mark_as(file, &index.id, generation, false),
      }
      tracing::debug!(
         "updated {file} in {}: +{} -{}",
         index.id,
         stats.added,
         stats.removed
      );
      Ok(UpdateOutcome::Applied(stats))
   }

   fn compute(
      &self,
      index: &RegisteredIndex,
      meta: &FileMetadata,
      content: Option<&[u8]>,
      memo: &mut DigestMemo,
   ) -> Result<KeyValueMap, ExtractError> {
      let ext = &index.extension;
      if !ext.depends_on_content() {
         return ext.extract(&IndexInput { meta, content: None });
      }
      let Some(bytes) = content else {
         return Ok(KeyValueMap::new());
      };
      if !ext.uses_snapshot_cache() {
         return ext.extract(&IndexInput { meta, content: Some(bytes) });
      }

      let digest = memo.get(ext.digest_flavor(meta), meta, bytes);
      let version = index.version().declared;
      if let Some(hit) = self.snapshots.lookup(&index.id, version, &digest) {
         return Ok((*hit).clone());
      }
      let data = Arc::new(ext.extract(&IndexInput { meta, content: Some(bytes) })?);
      if let Err(e) = self.snapshots.store(&index.id, version, &digest, &data) {
         tracing::warn!("failed to store snapshot for {}: {e}", meta.path);
      }
      Ok(Arc::unwrap_or_clone(data))
   }

   /// Indices that still need work for `file`: accepting indices whose
   /// stamp is not current, and any index still holding a stamp the file no
   /// longer qualifies for.
   fn stale_indices(&self, file: FileId, meta: &FileMetadata) -> Vec<Arc<RegisteredIndex>> {
      let held = self.stamps.list_non_trivial(file);
      self
         .registry
         .all()
         .into_iter()
         .filter(|index| index.rebuild.is_ok())
         .filter(|index| {
            if index.accepts(meta) {
               !self.stamps.get(file, &index.id).is_up_to_date()
            } else {
               held.contains(&index.id)
            }
         })
         .collect()
   }

   /// Whether any index has outstanding work for `file`.
   pub fn needs_indexing(&self, file: FileId, meta: &FileMetadata) -> bool {
      self.stamps.is_modified(file, meta.timestamp) || !self.stale_indices(file, meta).is_empty()
   }

   /// Reads `file` from the source and updates every stale index. Content is
   /// loaded at most once. The file timestamp is recorded only when every
   /// accepting index ended up current.
   pub fn index_file(&self, file: FileId, token: &IndexingToken) -> Result<FileOutcome> {
      let file = file.live();
      token.checkpoint()?;
      let Some(meta) = self.source.metadata(file)? else {
         self.remove_file(file)?;
         return Ok(FileOutcome::Removed);
      };

      if self.stamps.is_modified(file, meta.timestamp) {
         self.stamps.mark_all_outdated(file);
      }
      let stale = self.stale_indices(file, &meta);
      if stale.is_empty() {
         self.stamps.set_timestamp(file, meta.timestamp);
         return Ok(FileOutcome::Unchanged);
      }

      let wants_bytes = stale
         .iter()
         .any(|i| i.accepts(&meta) && i.extension.depends_on_content());
      let content = if wants_bytes && meta.len() <= self.max_file_size {
         token.checkpoint()?;
         Some(self.source.content(file)?)
      } else {
         if wants_bytes {
            tracing::debug!("{} exceeds the size limit; indexing without content", meta.path);
         }
         None
      };

      let mut memo = DigestMemo::default();
      let mut first_err = None;
      let mut failed = 0;
      for index in &stale {
         token.checkpoint()?;
         let input = FileContent::Present { meta: &meta, content: content.as_deref() };
         match self.update(file, index, input, &mut memo) {
            Ok(UpdateOutcome::ContentFailed) => failed += 1,
            Ok(_) => {},
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
               tracing::warn!("indexing {} into {} failed: {e}", meta.path, index.id);
               first_err.get_or_insert(e);
            },
         }
      }
      if let Some(err) = first_err {
         return Err(err);
      }

      if self.stale_indices(file, &meta).is_empty() {
         self.stamps.set_timestamp(file, meta.timestamp);
      }
      Ok(FileOutcome::Indexed { indices: stale.len(), failed })
   }

   /// Removes every trace of `file` from every index and forgets its
   /// stamps. Indices under rebuild are skipped; their data is cleared by
   /// the rebuild anyway.
   pub fn remove_file(&self, file: FileId) -> Result<()> {
      let file = file.live();
      let mut memo = DigestMemo::default();
      let mut first_err = None;
      for index in self.registry.all() {
         if !index.rebuild.is_ok() {
            continue;
         }
         index.storage.drop_buffered(file);
         if let Err(e) = self.update(file, &index, FileContent::Deleted, &mut memo) {
            tracing::warn!("removing {file} from {} failed: {e}", index.id);
            first_err.get_or_insert(e);
         }
      }
      match first_err {
         Some(err) => Err(err),
         None => {
            self.stamps.remove_file(file);
            Ok(())
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use tempfile::TempDir;

   use super::*;
   use crate::{
      extension::{
         IndexExtension,
         builtin::{FileTypeIndex, WordIndex},
      },
      source::MemoryFileSource,
      stamp::Stamp,
   };

   struct Fixture {
      _dir:   TempDir,
      source: Arc<MemoryFileSource>,
      stamps: Arc<StampRegistry>,
      reg:    Arc<IndexRegistry>,
      engine: UpdateEngine,
   }

   struct Exploding;

   impl IndexExtension for Exploding {
      fn name(&self) -> &str {
         "exploding"
      }

      fn version(&self) -> u32 {
         1
      }

      fn accepts(&self, _meta: &FileMetadata) -> bool {
         true
      }

      fn extract(&self, _input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError> {
         Err(ExtractError::new("boom"))
      }
   }

   fn fixture(max_file_size: u64) -> Fixture {
      let dir = TempDir::new().unwrap();
      let stamps = Arc::new(StampRegistry::open(dir.path().join("stamps.bin"), 4).unwrap());
      let snapshots = Arc::new(SnapshotCache::open(dir.path().join("snapshots"), 64).unwrap());
      let reg = Arc::new(
         IndexRegistry::new(dir.path().join("indices"), stamps.clone(), snapshots.clone(), 4, 100)
            .unwrap(),
      );
      reg.register(Arc::new(WordIndex), 0).unwrap();
      reg.register(Arc::new(FileTypeIndex), 0).unwrap();
      reg.register(Arc::new(Exploding), 0).unwrap();
      let source = Arc::new(MemoryFileSource::new());
      let engine = UpdateEngine::new(
         reg.clone(),
         stamps.clone(),
         snapshots,
         source.clone(),
         max_file_size,
         true,
      );
      Fixture { _dir: dir, source, stamps, reg, engine }
   }

   #[test]
   fn index_file_updates_all_indices_and_records_timestamp() {
      let fx = fixture(1024);
      let file = fx.source.add("a.rs", "alpha beta");
      let token = IndexingToken::new();

      let outcome = fx.engine.index_file(file, &token).unwrap();
      assert_eq!(outcome, FileOutcome::Indexed { indices: 3, failed: 1 });

      let words = fx.reg.get("words").unwrap();
      assert_eq!(words.storage.files_with_key("alpha").len(), 1);
      assert!(fx.stamps.get(file, &words.id).is_up_to_date());
      assert!(fx.stamps.is_failed(file, &fx.reg.get("exploding").unwrap().id));

      assert_eq!(fx.engine.index_file(file, &token).unwrap(), FileOutcome::Unchanged);
   }

   #[test]
   fn oversized_files_skip_content_but_not_metadata() {
      let fx = fixture(4);
      let file = fx.source.add("big.txt", "much too long");
      fx.engine.index_file(file, &IndexingToken::new()).unwrap();

      let words = fx.reg.get("words").unwrap();
      let types = fx.reg.get("filetype").unwrap();
      assert_eq!(words.storage.key_count(), 0);
      assert!(fx.stamps.get(file, &words.id).is_up_to_date());
      assert_eq!(types.storage.files_with_key("txt").len(), 1);
   }

   #[test]
   fn removal_clears_data_and_stamps() {
      let fx = fixture(1024);
      let file = fx.source.add("a.rs", "gamma");
      fx.engine.index_file(file, &IndexingToken::new()).unwrap();
      fx.source.remove(file);

      assert_eq!(fx.engine.index_file(file, &IndexingToken::new()).unwrap(), FileOutcome::Removed);
      let words = fx.reg.get("words").unwrap();
      assert!(words.storage.read("gamma").is_empty());
      assert_eq!(fx.stamps.get(file, &words.id), Stamp::NotIndexed);
      assert!(fx.stamps.list_non_trivial(file).is_empty());
   }

   #[test]
   fn cancelled_token_leaves_file_outdated() {
      let fx = fixture(1024);
      let file = fx.source.add("a.rs", "delta");
      let token = IndexingToken::new();
      token.cancel();
      assert!(fx.engine.index_file(file, &token).unwrap_err().is_cancelled());
      let words = fx.reg.get("words").unwrap();
      assert!(!fx.stamps.get(file, &words.id).is_up_to_date());
   }

   #[test]
   fn not_ready_index_refuses_updates() {
      let fx = fixture(1024);
      let file = fx.source.add("a.rs", "x1");
      let words = fx.reg.get("words").unwrap();
      fx.reg.request_rebuild(&words.id, "test");
      let meta = fx.source.metadata(file).unwrap().unwrap();
      let err = fx
         .engine
         .update(
            file,
            &words,
            FileContent::Present { meta: &meta, content: Some(b"x1") },
            &mut DigestMemo::default(),
         )
         .unwrap_err();
      assert!(matches!(err, Error::NotReady { .. }));
   }
}
