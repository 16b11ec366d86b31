#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::{
   collections::BTreeMap,
   path::Path,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use fbidx::{
   config::Config,
   engine::IndexEngine,
   extension::{ExtractError, IndexExtension, IndexInput, value},
   source::{FileMetadata, FileSource, MemoryFileSource},
   types::KeyValueMap,
};

pub const FAIL_MARKER: &str = "@@fail@@";

/// Whitespace-separated words mapped to their count. Counts every
/// extraction and refuses content containing [`FAIL_MARKER`].
pub struct CountingIndex {
   name:        String,
   version:     u32,
   extractions: Arc<AtomicUsize>,
   accept_ext:  Option<&'static str>,
}

impl CountingIndex {
   pub fn new(name: &str, version: u32) -> Self {
      Self {
         name: name.to_string(),
         version,
         extractions: Arc::new(AtomicUsize::new(0)),
         accept_ext: None,
      }
   }

   /// Only files whose type is `ext`.
   pub fn only(mut self, ext: &'static str) -> Self {
      self.accept_ext = Some(ext);
      self
   }

   pub fn counter(&self) -> Arc<AtomicUsize> {
      Arc::clone(&self.extractions)
   }

   pub fn into_arc(self) -> (Arc<dyn IndexExtension>, Arc<AtomicUsize>) {
      let counter = self.counter();
      (Arc::new(self), counter)
   }
}

impl IndexExtension for CountingIndex {
   fn name(&self) -> &str {
      &self.name
   }

   fn version(&self) -> u32 {
      self.version
   }

   fn accepts(&self, meta: &FileMetadata) -> bool {
      self.accept_ext.is_none_or(|ext| meta.file_type == ext)
   }

   fn extract(&self, input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError> {
      self.extractions.fetch_add(1, Ordering::SeqCst);
      let text = input.text().unwrap_or_default();
      if text.contains(FAIL_MARKER) {
         return Err(ExtractError::new("refusing marked content"));
      }
      let mut counts = BTreeMap::<String, u32>::new();
      for word in text.split_whitespace() {
         *counts.entry(word.to_string()).or_default() += 1;
      }
      counts
         .into_iter()
         .map(|(k, n)| {
            value::encode(&n)
               .map(|v| (k, v))
               .map_err(|e| ExtractError::new(e.to_string()))
         })
         .collect()
   }
}

/// File type of every file, without reading content.
pub struct TypeIndex;

impl IndexExtension for TypeIndex {
   fn name(&self) -> &str {
      "types"
   }

   fn version(&self) -> u32 {
      1
   }

   fn accepts(&self, _meta: &FileMetadata) -> bool {
      true
   }

   fn extract(&self, input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError> {
      assert!(input.content.is_none(), "content-less index was handed bytes");
      Ok(KeyValueMap::from([(input.meta.file_type.clone(), Vec::new())]))
   }

   fn depends_on_content(&self) -> bool {
      false
   }
}

pub fn test_config() -> Config {
   Config {
      indexing_threads: 4,
      background_maintenance: false,
      flush_interval_ms: 50,
      rebuild_backoff_ms: 1,
      rebuild_max_retries: 3,
      strict_invariants: true,
      ..Config::default()
   }
}

pub fn open_engine(
   root: &Path,
   source: &Arc<MemoryFileSource>,
   extensions: Vec<Arc<dyn IndexExtension>>,
) -> Arc<IndexEngine> {
   open_with(root, source, extensions, test_config())
}

pub fn open_with(
   root: &Path,
   source: &Arc<MemoryFileSource>,
   extensions: Vec<Arc<dyn IndexExtension>>,
   config: Config,
) -> Arc<IndexEngine> {
   let source: Arc<dyn FileSource> = Arc::clone(source) as Arc<dyn FileSource>;
   IndexEngine::open(root, Arc::new(config), source, extensions).expect("open engine")
}

pub fn count(value: &[u8]) -> u32 {
   value::decode(value).expect("count value")
}
