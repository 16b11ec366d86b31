//! Pluggable key/value extraction, one [`IndexExtension`] per index.

pub mod builtin;

use std::borrow::Cow;

use thiserror::Error;

use crate::{
   snapshot::DigestFlavor,
   source::FileMetadata,
   types::KeyValueMap,
};

/// Extraction failure for a single file. Never affects other files.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExtractError(pub String);

impl ExtractError {
   pub fn new(message: impl Into<String>) -> Self {
      Self(message.into())
   }
}

/// What an extension sees for one file.
pub struct IndexInput<'a> {
   pub meta:    &'a FileMetadata,
   /// `None` for content-less indices and for files above the size limit.
   pub content: Option<&'a [u8]>,
}

impl IndexInput<'_> {
   /// Content decoded as text, lossily.
   pub fn text(&self) -> Option<Cow<'_, str>> {
      self.content.map(String::from_utf8_lossy)
   }
}

/// Capability interface of one index.
pub trait IndexExtension: Send + Sync {
   /// Unique, filesystem-safe name.
   fn name(&self) -> &str;

   /// Bump whenever extraction output for the same input changes.
   fn version(&self) -> u32;

   /// Input filter. Files not accepted contribute nothing.
   fn accepts(&self, meta: &FileMetadata) -> bool;

   fn extract(&self, input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError>;

   /// Metadata-only indices never read bytes.
   fn depends_on_content(&self) -> bool {
      true
   }

   fn uses_snapshot_cache(&self) -> bool {
      self.depends_on_content()
   }

   fn keeps_forward_index(&self) -> bool {
      true
   }

   fn digest_flavor(&self, meta: &FileMetadata) -> DigestFlavor {
      DigestFlavor::for_file(meta)
   }
}

/// Typed value helpers over postcard.
pub mod value {
   use serde::{Serialize, de::DeserializeOwned};

   use crate::{Result, types::Value};

   pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
      Ok(postcard::to_allocvec(value)?)
   }

   pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
      Ok(postcard::from_bytes(bytes)?)
   }
}

/// Index names double as directory names.
pub fn is_valid_name(name: &str) -> bool {
   !name.is_empty()
      && name.len() <= 64
      && name
         .bytes()
         .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
      && !name.starts_with('.')
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn names_are_filesystem_safe() {
      assert!(is_valid_name("words.v2"));
      assert!(!is_valid_name("../escape"));
      assert!(!is_valid_name(".hidden"));
      assert!(!is_valid_name(""));
   }

   #[test]
   fn value_helpers_round_trip() {
      let bytes = value::encode(&42u32).unwrap();
      assert_eq!(value::decode::<u32>(&bytes).unwrap(), 42);
   }
}
