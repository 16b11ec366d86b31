//! Content-addressed memoization of extraction output.
//!
//! Entries are keyed by (index, declared version, digest) and are only ever
//! inserted, never rewritten. On disk each entry is one checksummed file at
//! `<root>/<index>/v<version>/<aa>/<digest>.bin`; a `moka` cache in front
//! serves hot entries without touching the filesystem. A damaged entry is
//! deleted and reported as a miss.

use std::{
   fs, io,
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use moka::sync::Cache;
use serde::Serialize;

use super::digest::ContentDigest;
use crate::{
   Result,
   types::{IndexId, KeyValueMap},
   util,
};

const ENTRY_MAGIC: [u8; 4] = *b"FBSN";
const ENTRY_SCHEMA: u32 = 1;

type HotKey = (IndexId, u32, ContentDigest);

/// Counters since open.
#[derive(Serialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
   pub hits:   u64,
   pub misses: u64,
   pub writes: u64,
}

pub struct SnapshotCache {
   root:   PathBuf,
   hot:    Cache<HotKey, Arc<KeyValueMap>>,
   hits:   AtomicU64,
   misses: AtomicU64,
   writes: AtomicU64,
}

impl SnapshotCache {
   pub fn open(root: impl Into<PathBuf>, hot_entries: u64) -> Result<Self> {
      let root = root.into();
      fs::create_dir_all(&root)?;
      Ok(Self {
         root,
         hot: Cache::new(hot_entries.max(1)),
         hits: AtomicU64::new(0),
         misses: AtomicU64::new(0),
         writes: AtomicU64::new(0),
      })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   fn version_dir(&self, index: &IndexId, version: u32) -> PathBuf {
      self.root.join(index.as_str()).join(format!("v{version}"))
   }

   fn entry_path(&self, index: &IndexId, version: u32, digest: &ContentDigest) -> PathBuf {
      let hex = digest.to_string();
      self
         .version_dir(index, version)
         .join(&hex[..2])
         .join(format!("{hex}.bin"))
   }

   pub fn lookup(
      &self,
      index: &IndexId,
      version: u32,
      digest: &ContentDigest,
   ) -> Option<Arc<KeyValueMap>> {
      let key = (index.clone(), version, *digest);
      if let Some(hit) = self.hot.get(&key) {
         self.hits.fetch_add(1, Ordering::Relaxed);
         return Some(hit);
      }

      let path = self.entry_path(index, version, digest);
      let loaded = match fs::read(&path) {
         Ok(bytes) => {
            match util::decode_framed::<KeyValueMap>(&path, ENTRY_MAGIC, ENTRY_SCHEMA, &bytes) {
               Ok(map) => Some(Arc::new(map)),
               Err(e) => {
                  tracing::warn!("dropping damaged snapshot {}: {e}", path.display());
                  let _ = fs::remove_file(&path);
                  None
               },
            }
         },
         Err(e) if e.kind() == io::ErrorKind::NotFound => None,
         Err(e) => {
            tracing::warn!("failed to read snapshot {}: {e}", path.display());
            None
         },
      };

      match loaded {
         Some(map) => {
            self.hot.insert(key, Arc::clone(&map));
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(map)
         },
         None => {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
         },
      }
   }

   /// Inserts `map` unless an entry for the digest already exists; existing
   /// entries are never replaced. Returns whether anything was written.
   pub fn store(
      &self,
      index: &IndexId,
      version: u32,
      digest: &ContentDigest,
      map: &Arc<KeyValueMap>,
   ) -> Result<bool> {
      let key = (index.clone(), version, *digest);
      let path = self.entry_path(index, version, digest);
      if self.hot.contains_key(&key) || path.exists() {
         self.hot.insert(key, Arc::clone(map));
         return Ok(false);
      }

      let bytes = util::encode_framed(ENTRY_MAGIC, ENTRY_SCHEMA, &**map)?;
      util::write_atomic(&path, &bytes)?;

      self.hot.insert(key, Arc::clone(map));
      self.writes.fetch_add(1, Ordering::Relaxed);
      Ok(true)
   }

   /// Removes every entry of `index`.
   pub fn drop_index(&self, index: &IndexId) -> Result<()> {
      remove_dir_if_exists(&self.root.join(index.as_str()))?;
      self.hot.invalidate_all();
      Ok(())
   }

   /// Removes entries of `index` written under any other declared version.
   pub fn retain_version(&self, index: &IndexId, version: u32) -> Result<()> {
      let dir = self.root.join(index.as_str());
      let keep = format!("v{version}");
      let entries = match fs::read_dir(&dir) {
         Ok(entries) => entries,
         Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
         Err(e) => return Err(e.into()),
      };
      for entry in entries {
         let entry = entry?;
         if entry.file_name() != keep.as_str() {
            remove_dir_if_exists(&entry.path())?;
         }
      }
      self.hot.invalidate_all();
      Ok(())
   }

   /// Index names with entries on disk.
   pub fn indices_on_disk(&self) -> Result<Vec<String>> {
      let mut out = Vec::new();
      for entry in fs::read_dir(&self.root)? {
         let entry = entry?;
         if entry.file_type()?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
         }
      }
      Ok(out)
   }

   pub fn stats(&self) -> SnapshotStats {
      SnapshotStats {
         hits:   self.hits.load(Ordering::Relaxed),
         misses: self.misses.load(Ordering::Relaxed),
         writes: self.writes.load(Ordering::Relaxed),
      }
   }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
   match fs::remove_dir_all(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
   }
}
