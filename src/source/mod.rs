//! File sources: where file ids, metadata, and bytes come from.

pub mod local;
pub mod memory;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use self::{local::LocalFileSource, memory::MemoryFileSource};
use crate::{
   Result,
   types::{FileId, FileTimestamp},
};

pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Everything an index may look at without reading content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
   pub id:        FileId,
   pub path:      String,
   pub file_type: String,
   pub charset:   String,
   pub timestamp: FileTimestamp,
   pub is_binary: bool,
}

impl FileMetadata {
   pub const fn len(&self) -> u64 {
      self.timestamp.len
   }

   pub const fn is_empty(&self) -> bool {
      self.timestamp.len == 0
   }
}

/// Upstream collaborator supplying stable ids and content.
///
/// Ids must stay stable for a file's lifetime and must not be reused before
/// a removal of the previous owner has been reported.
pub trait FileSource: Send + Sync {
   /// Every live file.
   fn files(&self) -> Result<Vec<FileId>>;

   /// `None` when the file no longer exists.
   fn metadata(&self, id: FileId) -> Result<Option<FileMetadata>>;

   fn content(&self, id: FileId) -> Result<Bytes>;

   /// Bumped when the source's id space is reset; part of every index's
   /// effective version.
   fn generation(&self) -> u64 {
      0
   }

   /// Makes any id assignments durable. Called before stamps are persisted
   /// so no stamp outlives the id it refers to.
   fn persist(&self) -> Result<()> {
      Ok(())
   }
}

/// Files whose first 8 KiB contain a NUL byte are treated as binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
   memchr::memchr(0, &bytes[..bytes.len().min(8192)]).is_some()
}

/// Declared charset from a byte-order mark, defaulting to UTF-8.
pub fn detect_charset(bytes: &[u8]) -> &'static str {
   match bytes {
      [0xEF, 0xBB, 0xBF, ..] => "UTF-8",
      [0xFF, 0xFE, ..] => "UTF-16LE",
      [0xFE, 0xFF, ..] => "UTF-16BE",
      _ => DEFAULT_CHARSET,
   }
}

/// File type from the extension, `"plain"` when there is none.
pub fn file_type_of(path: &str) -> String {
   let name = path.rsplit('/').next().unwrap_or(path);
   match name.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
      _ => "plain".to_string(),
   }
}
