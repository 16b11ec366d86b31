//! CLI command implementations for fbidx.
//!
//! Every command opens the engine for a directory (the current one by
//! default), does its work, and shuts the engine down cleanly.

pub mod index;
pub mod query;
pub mod rebuild;
pub mod status;
pub mod watch;

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use crate::{
   Result, config,
   engine::IndexEngine,
   extension::builtin,
   identity,
   source::{FileSource, LocalFileSource},
};

const PATH_TABLE: &str = "paths.json";

/// An engine over a local directory plus the source feeding it.
pub struct LocalEngine {
   pub engine: Arc<IndexEngine>,
   pub source: Arc<LocalFileSource>,
}

impl LocalEngine {
   pub fn shutdown(self) -> Result<()> {
      self.engine.shutdown()
   }
}

pub fn resolve_root(path: Option<PathBuf>) -> Result<PathBuf> {
   let path = match path {
      Some(path) => path,
      None => std::env::current_dir()?,
   };
   Ok(identity::canonical_root(&path))
}

/// Opens the engine for `root` with the built-in indices.
pub fn open_engine(root: &Path, background: bool) -> Result<LocalEngine> {
   let mut cfg = config::init_for_root(root).clone();
   cfg.background_maintenance = background;
   let data_root = identity::data_root(root, &cfg);
   std::fs::create_dir_all(&data_root)?;

   let source = Arc::new(LocalFileSource::open(root, data_root.join(PATH_TABLE))?);
   let dyn_source: Arc<dyn FileSource> = Arc::clone(&source) as Arc<dyn FileSource>;
   let engine = IndexEngine::open(data_root, Arc::new(cfg), dyn_source, builtin::defaults())?;
   Ok(LocalEngine { engine, source })
}
