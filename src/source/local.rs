//! File source over a directory tree.

use std::{
   collections::BTreeMap,
   fs,
   io::Read,
   path::{Path, PathBuf},
   sync::atomic::{AtomicBool, Ordering},
   time::UNIX_EPOCH,
};

use bytes::Bytes;
use ignore::WalkBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{FileMetadata, FileSource, detect_charset, file_type_of, looks_binary};
use crate::{
   Result,
   error::SourceError,
   types::{FileId, FileTimestamp},
   util,
};

#[derive(Serialize, Deserialize, Default)]
struct IdTable {
   /// Changes whenever the table starts over, so data recorded under the
   /// previous id assignment is never trusted.
   #[serde(default)]
   generation: u64,
   next_id:    i32,
   by_path:    BTreeMap<String, FileId>,
   #[serde(skip)]
   by_id:      BTreeMap<FileId, String>,
}

impl IdTable {
   fn reindex(&mut self) {
      self.by_id = self.by_path.iter().map(|(p, id)| (*id, p.clone())).collect();
      let max = self.by_path.values().map(|id| id.raw()).max().unwrap_or(0);
      self.next_id = self.next_id.max(max + 1).max(1);
   }
}

/// Walks `root` honoring `.gitignore`, keeping a persistent path ↔ id table
/// so ids survive restarts.
pub struct LocalFileSource {
   root:       PathBuf,
   table_path: PathBuf,
   table:      RwLock<IdTable>,
   dirty:      AtomicBool,
}

impl LocalFileSource {
   pub fn open(root: &Path, table_path: impl Into<PathBuf>) -> Result<Self> {
      let root = root.canonicalize()?;
      let table_path = table_path.into();
      let loaded = match fs::read(&table_path) {
         Ok(bytes) => serde_json::from_slice::<IdTable>(&bytes)
            .inspect_err(|e| tracing::warn!("resetting file id table: {e}"))
            .ok(),
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
         Err(e) => return Err(e.into()),
      };
      let fresh = loaded.is_none();
      let mut table = loaded.unwrap_or_else(|| IdTable {
         generation: util::unix_millis(),
         ..IdTable::default()
      });
      table.reindex();
      let source =
         Self { root, table_path, table: RwLock::new(table), dirty: AtomicBool::new(fresh) };
      if fresh {
         source.save()?;
      }
      Ok(source)
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   fn relative(&self, path: &Path) -> Result<String> {
      let rel = path
         .strip_prefix(&self.root)
         .map_err(|_| SourceError::OutsideRoot(path.to_path_buf()))?;
      Ok(rel.to_string_lossy().replace('\\', "/"))
   }

   /// Id of `path`, assigning a fresh one for unseen paths.
   pub fn id_for_path(&self, path: &Path) -> Result<FileId> {
      let rel = self.relative(path)?;
      if let Some(id) = self.table.read().by_path.get(&rel) {
         return Ok(*id);
      }
      let mut table = self.table.write();
      if let Some(id) = table.by_path.get(&rel) {
         return Ok(*id);
      }
      let id = FileId::new(table.next_id);
      table.next_id += 1;
      table.by_path.insert(rel.clone(), id);
      table.by_id.insert(id, rel);
      self.dirty.store(true, Ordering::Release);
      Ok(id)
   }

   /// Known id of `path`, without assigning.
   pub fn lookup(&self, path: &Path) -> Option<FileId> {
      let rel = self.relative(path).ok()?;
      self.table.read().by_path.get(&rel).copied()
   }

   /// Known ids of every file below the directory `path`.
   pub fn ids_under(&self, path: &Path) -> Vec<FileId> {
      let Ok(rel) = self.relative(path) else {
         return Vec::new();
      };
      let prefix = format!("{}/", rel.trim_end_matches('/'));
      let table = self.table.read();
      table
         .by_path
         .range(prefix.clone()..)
         .take_while(|(p, _)| p.starts_with(&prefix))
         .map(|(_, id)| *id)
         .collect()
   }

   pub fn path_of(&self, id: FileId) -> Option<PathBuf> {
      self.table.read().by_id.get(&id).map(|rel| self.root.join(rel))
   }

   /// Forgets the id of a deleted path. Ids are never handed out again.
   pub fn forget(&self, id: FileId) {
      let mut table = self.table.write();
      if let Some(rel) = table.by_id.remove(&id) {
         table.by_path.remove(&rel);
         self.dirty.store(true, Ordering::Release);
      }
   }

   pub fn save(&self) -> Result<()> {
      if !self.dirty.swap(false, Ordering::AcqRel) {
         return Ok(());
      }
      let data = serde_json::to_vec(&*self.table.read())?;
      util::write_atomic(&self.table_path, &data)
   }

   fn walk(&self) -> impl Iterator<Item = PathBuf> {
      WalkBuilder::new(&self.root)
         .hidden(false)
         .git_ignore(true)
         .require_git(false)
         .filter_entry(|e| e.file_name() != ".git")
         .build()
         .filter_map(|entry| {
            entry
               .inspect_err(|e| tracing::warn!("walk error: {e}"))
               .ok()
         })
         .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
         .map(ignore::DirEntry::into_path)
   }
}

impl FileSource for LocalFileSource {
   fn files(&self) -> Result<Vec<FileId>> {
      let mut ids = Vec::new();
      for path in self.walk() {
         ids.push(self.id_for_path(&path)?);
      }
      self.save()?;
      ids.sort_unstable();
      Ok(ids)
   }

   fn metadata(&self, id: FileId) -> Result<Option<FileMetadata>> {
      let Some(path) = self.path_of(id) else {
         return Ok(None);
      };
      let meta = match fs::metadata(&path) {
         Ok(m) if m.is_file() => m,
         Ok(_) => return Ok(None),
         Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
         Err(source) => return Err(SourceError::Read { path, source }.into()),
      };
      let modified_ms = meta
         .modified()
         .ok()
         .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
         .map_or(0, |d| d.as_millis() as u64);

      let mut head = Vec::with_capacity(8192);
      fs::File::open(&path)
         .and_then(|f| f.take(8192).read_to_end(&mut head))
         .map_err(|source| SourceError::Read { path: path.clone(), source })?;

      let rel = self.relative(&path)?;
      Ok(Some(FileMetadata {
         id,
         file_type: file_type_of(&rel),
         path: rel,
         charset: detect_charset(&head).to_string(),
         timestamp: FileTimestamp { modified_ms, len: meta.len() },
         is_binary: looks_binary(&head),
      }))
   }

   fn content(&self, id: FileId) -> Result<Bytes> {
      let path = self.path_of(id).ok_or(crate::Error::UnknownFile(id))?;
      let bytes = fs::read(&path).map_err(|source| SourceError::Read { path, source })?;
      Ok(Bytes::from(bytes))
   }

   fn generation(&self) -> u64 {
      self.table.read().generation
   }

   fn persist(&self) -> Result<()> {
      self.save()
   }
}
