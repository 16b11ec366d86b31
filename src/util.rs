//! Utility functions for filesystem operations and on-disk framing

use std::{
   fs,
   io::Write,
   path::{Path, PathBuf},
   time::{SystemTime, UNIX_EPOCH},
};

use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{Result, error::StorageError};

const CHECKSUM_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 4 + CHECKSUM_LEN;

/// Returns `Err` when the named fail point is armed (crash-injection builds).
pub fn fail_point(name: &'static str) -> Result<()> {
   #[cfg(feature = "failpoints")]
   {
      fail::fail_point!(name, |_| Err(crate::Error::FailPoint(name)));
   }
   #[cfg(not(feature = "failpoints"))]
   let _ = name;
   Ok(())
}

/// Flushes directory metadata so a preceding rename survives power loss.
pub fn fsync_dir(path: &Path) -> Result<()> {
   if cfg!(unix) {
      fs::File::open(path)?.sync_all()?;
   }
   Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
   let name = path
      .file_name()
      .map_or_else(|| "data".into(), |n| n.to_string_lossy().into_owned());
   path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Writes `data` to `path` via temp file, fsync and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
   if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
   }
   let tmp_path = temp_path(path);
   {
      let mut file = fs::File::create(&tmp_path)?;
      file.write_all(data)?;
      file.sync_all()?;
   }
   if let Err(e) = fs::rename(&tmp_path, path) {
      let _ = fs::remove_file(&tmp_path);
      return Err(e.into());
   }
   if let Some(parent) = path.parent() {
      fsync_dir(parent)?;
   }
   Ok(())
}

/// Serializes `value` with postcard behind a `magic | schema | sha256` header.
pub fn encode_framed<T: Serialize>(magic: [u8; 4], schema: u32, value: &T) -> Result<Vec<u8>> {
   let body = postcard::to_allocvec(value)?;
   let mut out = Vec::with_capacity(HEADER_LEN + body.len());
   out.extend_from_slice(&magic);
   out.extend_from_slice(&schema.to_le_bytes());
   out.extend_from_slice(&Sha256::digest(&body));
   out.extend_from_slice(&body);
   Ok(out)
}

/// Inverse of [`encode_framed`]; any header or checksum mismatch is corruption.
pub fn decode_framed<T: DeserializeOwned>(
   path: &Path,
   magic: [u8; 4],
   schema: u32,
   bytes: &[u8],
) -> Result<T, StorageError> {
   let corrupted = |reason: &str| StorageError::Corrupted {
      path:   path.to_path_buf(),
      reason: reason.to_string(),
   };
   if bytes.len() < HEADER_LEN {
      return Err(corrupted("truncated header"));
   }
   let (header, body) = bytes.split_at(HEADER_LEN);
   if header[..4] != magic {
      return Err(corrupted("bad magic"));
   }
   let found = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
   if found != schema {
      return Err(corrupted(&format!("schema {found}, expected {schema}")));
   }
   if header[8..] != Sha256::digest(body)[..] {
      return Err(corrupted("checksum mismatch"));
   }
   Ok(postcard::from_bytes(body)?)
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
   SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| d.as_millis() as u64)
}

/// Recursively calculates the total size of a directory in bytes
pub fn get_dir_size(path: &Path) -> u64 {
   walkdir::WalkDir::new(path)
      .into_iter()
      .filter_map(|e| e.ok())
      .filter_map(|e| e.metadata().ok())
      .filter(|m| m.is_file())
      .map(|m| m.len())
      .sum()
}

/// Formats a byte count as a human-readable size string
pub fn format_size(bytes: u64) -> String {
   const KB: u64 = 1024;
   const MB: u64 = KB * 1024;
   const GB: u64 = MB * 1024;

   if bytes < KB {
      format!("{bytes} B")
   } else if bytes < MB {
      format!("{:.1} KB", bytes as f64 / KB as f64)
   } else if bytes < GB {
      format!("{:.1} MB", bytes as f64 / MB as f64)
   } else {
      format!("{:.1} GB", bytes as f64 / GB as f64)
   }
}
