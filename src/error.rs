use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
   registry::RebuildState,
   types::{FileId, IndexId},
};

/// Main error type for the fbidx engine.
///
/// Variants follow the engine's failure taxonomy: content errors stay local
/// to one file, storage errors put one index into rebuild, cancellation
/// aborts the current unit of work, and invariant violations are programming
/// errors.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred outside of an index's own storage.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// An index's backing store failed or is corrupted.
   #[error("storage error in index {index}: {source}")]
   Storage {
      index:  IndexId,
      #[source]
      source: StorageError,
   },

   /// Extraction failed for one file.
   #[error("failed to index {file} for {index}: {message}")]
   Content { file: FileId, index: IndexId, message: String },

   /// The current unit of work was cancelled cooperatively.
   #[error("indexing cancelled")]
   Cancelled,

   /// The index is being rebuilt and cannot serve reads.
   #[error("index {index} is not ready ({state})")]
   NotReady { index: IndexId, state: RebuildState },

   /// No index with this name is registered.
   #[error("unknown index: {0}")]
   UnknownIndex(String),

   /// Two extensions were registered under the same name.
   #[error("index {0} registered twice")]
   DuplicateIndex(IndexId),

   /// The file source does not know this file.
   #[error("unknown file {0}")]
   UnknownFile(FileId),

   /// Unsaved content was submitted while buffering is off.
   #[error("buffering is disabled for index {0}")]
   BufferingDisabled(IndexId),

   /// Reentrancy or ordering violation.
   #[error("invariant violated: {0}")]
   Invariant(String),

   /// Another process holds the data directory.
   #[error("data directory is locked by another process: {path}", path = _0.display())]
   Locked(PathBuf),

   /// The engine has been shut down.
   #[error("engine is shut down")]
   ShutDown,

   /// Injected failure (crash-injection tests).
   #[error("fail point triggered: {0}")]
   FailPoint(&'static str),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// File source error occurred.
   #[error("source error: {0}")]
   Source(#[from] SourceError),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// Postcard serialization or deserialization error occurred.
   #[error("postcard error: {0}")]
   Postcard(#[from] postcard::Error),

   /// Worker pool could not be created.
   #[error("thread pool error: {0}")]
   ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
   pub const fn storage(index: IndexId, source: StorageError) -> Self {
      Self::Storage { index, source }
   }

   /// Whether this failure broke the index it happened in, as opposed to
   /// being local to one file. A full overlay only refuses the update.
   pub const fn is_storage(&self) -> bool {
      matches!(
         self,
         Self::Storage { source, .. } if !matches!(source, StorageError::BufferOverflow { .. })
      )
   }

   pub const fn is_cancelled(&self) -> bool {
      matches!(self, Self::Cancelled)
   }

   pub const fn exit_code(&self) -> i32 {
      match self {
         Self::NotReady { .. } | Self::Locked(_) => 10,
         Self::Cancelled => 12,
         Self::Storage { .. } => 13,
         Self::UnknownIndex(_) | Self::UnknownFile(_) => 2,
         _ => 1,
      }
   }
}

/// Failures of an index's backing store.
#[derive(Debug, Error)]
pub enum StorageError {
   /// Underlying I/O failed.
   #[error("io: {0}")]
   Io(#[from] io::Error),

   /// Stored bytes failed to decode.
   #[error("decode: {0}")]
   Decode(#[from] postcard::Error),

   /// Header, checksum, or schema mismatch.
   #[error("corrupted store {path}: {reason}", path = path.display())]
   Corrupted { path: PathBuf, reason: String },

   /// The in-memory overlay reached its key budget.
   #[error("buffered overlay is full ({limit} keys)")]
   BufferOverflow { limit: usize },

   /// Injected failure (crash-injection tests).
   #[error("fail point triggered: {0}")]
   Injected(&'static str),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config values are out of range.
   #[error("invalid config: {0}")]
   Invalid(String),
}

/// Errors raised by a file source.
#[derive(Debug, Error)]
pub enum SourceError {
   /// The file could not be read.
   #[error("failed to read {path}: {source}", path = path.display())]
   Read {
      path:   PathBuf,
      #[source]
      source: io::Error,
   },

   /// The path is not below the source root.
   #[error("path is outside the indexed root: {path}", path = _0.display())]
   OutsideRoot(PathBuf),
}

impl From<notify::Error> for Error {
   fn from(e: notify::Error) -> Self {
      Self::Io(io::Error::other(e))
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
