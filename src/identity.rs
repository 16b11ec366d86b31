//! Store identity: which data directory a source root maps to.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config;

const STORE_ID_HASH_LEN: usize = 12;

/// Resolves symlinks where possible; falls back to the path as given.
pub fn canonical_root(root: &Path) -> PathBuf {
   root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

/// `<dir-name>-<sha256(canonical root)[..12]>`.
pub fn store_id(root: &Path) -> String {
   let root = canonical_root(root);
   let base = root
      .file_name()
      .and_then(|n| n.to_str())
      .unwrap_or("root")
      .to_string();
   let hash = hex::encode(Sha256::digest(root.to_string_lossy().as_bytes()));
   format!("{base}-{}", &hash[..STORE_ID_HASH_LEN])
}

/// Data directory for `root`, honoring a configured override.
pub fn data_root(root: &Path, cfg: &config::Config) -> PathBuf {
   match &cfg.data_dir {
      Some(dir) => dir.clone(),
      None => config::data_dir().join(store_id(root)),
   }
}
