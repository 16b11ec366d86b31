//! Persistent half of an index: inverted map plus optional forward map,
//! written together as one checksummed file so the two never disagree.

use std::{
   collections::{BTreeMap, BTreeSet},
   fs, io,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
   error::StorageError,
   types::{FileId, Key, KeyValueMap, Value},
   util,
};

const STORE_MAGIC: [u8; 4] = *b"FBIX";
const STORE_SCHEMA: u32 = 1;
const STORE_FILE: &str = "store.bin";

pub type Postings = BTreeMap<FileId, Value>;

#[derive(Serialize, Deserialize, Default)]
struct BackendData {
   inverted: BTreeMap<Key, Postings>,
   forward:  Option<BTreeMap<FileId, KeyValueMap>>,
}

pub struct Backend {
   path:  PathBuf,
   data:  BackendData,
   dirty: bool,
}

impl Backend {
   pub fn open(dir: &Path, keep_forward: bool) -> Result<Self, StorageError> {
      fs::create_dir_all(dir)?;
      let path = dir.join(STORE_FILE);
      let mut data = match fs::read(&path) {
         Ok(bytes) => util::decode_framed::<BackendData>(&path, STORE_MAGIC, STORE_SCHEMA, &bytes)?,
         Err(e) if e.kind() == io::ErrorKind::NotFound => BackendData::default(),
         Err(e) => return Err(e.into()),
      };

      let mut dirty = false;
      match (keep_forward, data.forward.is_some()) {
         (true, false) => {
            data.forward = Some(invert(&data.inverted));
            dirty = !data.inverted.is_empty();
         },
         (false, true) => {
            data.forward = None;
            dirty = true;
         },
         _ => {},
      }
      Ok(Self { path, data, dirty })
   }

   pub fn read(&self, key: &str) -> Option<&Postings> {
      self.data.inverted.get(key)
   }

   pub fn keys(&self) -> impl Iterator<Item = (&Key, &Postings)> {
      self.data.inverted.iter()
   }

   pub fn key_count(&self) -> usize {
      self.data.inverted.len()
   }

   pub fn add(&mut self, key: &str, file: FileId, value: Value) {
      self
         .data
         .inverted
         .entry(key.to_string())
         .or_default()
         .insert(file, value);
      self.dirty = true;
   }

   pub fn remove(&mut self, key: &str, file: FileId) -> bool {
      let Some(postings) = self.data.inverted.get_mut(key) else {
         return false;
      };
      let removed = postings.remove(&file).is_some();
      if postings.is_empty() {
         self.data.inverted.remove(key);
      }
      self.dirty |= removed;
      removed
   }

   /// What `file` currently contributes. Falls back to a full scan of the
   /// inverted map when the forward map is disabled.
   pub fn data_of(&self, file: FileId) -> KeyValueMap {
      match &self.data.forward {
         Some(forward) => forward.get(&file).cloned().unwrap_or_default(),
         None => self
            .data
            .inverted
            .iter()
            .filter_map(|(key, postings)| postings.get(&file).map(|v| (key.clone(), v.clone())))
            .collect(),
      }
   }

   /// Every file with at least one stored key.
   pub fn files(&self) -> BTreeSet<FileId> {
      match &self.data.forward {
         Some(forward) => forward.keys().copied().collect(),
         None => self
            .data
            .inverted
            .values()
            .flat_map(|postings| postings.keys().copied())
            .collect(),
      }
   }

   pub fn set_forward(&mut self, file: FileId, data: KeyValueMap) {
      if let Some(forward) = &mut self.data.forward {
         if data.is_empty() {
            forward.remove(&file);
         } else {
            forward.insert(file, data);
         }
         self.dirty = true;
      }
   }

   pub fn flush(&mut self) -> Result<(), StorageError> {
      if !self.dirty {
         return Ok(());
      }
      util::fail_point("storage.before_save")
         .map_err(|_| StorageError::Injected("storage.before_save"))?;
      let bytes = util::encode_framed(STORE_MAGIC, STORE_SCHEMA, &self.data).map_err(to_storage)?;
      util::write_atomic(&self.path, &bytes).map_err(to_storage)?;
      self.dirty = false;
      Ok(())
   }

   pub fn clear(&mut self) -> Result<(), StorageError> {
      let keep_forward = self.data.forward.is_some();
      self.data = BackendData {
         inverted: BTreeMap::new(),
         forward:  keep_forward.then(BTreeMap::new),
      };
      match fs::remove_file(&self.path) {
         Ok(()) => {},
         Err(e) if e.kind() == io::ErrorKind::NotFound => {},
         Err(e) => return Err(e.into()),
      }
      self.dirty = false;
      Ok(())
   }
}

fn invert(inverted: &BTreeMap<Key, Postings>) -> BTreeMap<FileId, KeyValueMap> {
   let mut forward: BTreeMap<FileId, KeyValueMap> = BTreeMap::new();
   for (key, postings) in inverted {
      for (file, value) in postings {
         forward.entry(*file).or_default().insert(key.clone(), value.clone());
      }
   }
   forward
}

fn to_storage(err: crate::Error) -> StorageError {
   match err {
      crate::Error::Io(e) => StorageError::Io(e),
      crate::Error::Postcard(e) => StorageError::Decode(e),
      other => StorageError::Io(io::Error::other(other.to_string())),
   }
}
