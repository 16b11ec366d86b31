//! Stock indices shipped with the CLI.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::{ExtractError, IndexExtension, IndexInput, value};
use crate::{source::FileMetadata, types::KeyValueMap};

static IDENTIFIER: LazyLock<Result<Regex, regex::Error>> =
   LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{1,63}"));

/// Identifier tokens of text files mapped to their occurrence count.
pub struct WordIndex;

impl IndexExtension for WordIndex {
   fn name(&self) -> &str {
      "words"
   }

   fn version(&self) -> u32 {
      1
   }

   fn accepts(&self, meta: &FileMetadata) -> bool {
      !meta.is_binary
   }

   fn extract(&self, input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError> {
      let re = IDENTIFIER
         .as_ref()
         .map_err(|e| ExtractError::new(format!("tokenizer: {e}")))?;
      let Some(text) = input.text() else {
         return Ok(KeyValueMap::new());
      };
      let mut counts = std::collections::BTreeMap::<String, u32>::new();
      for m in re.find_iter(&text) {
         *counts.entry(m.as_str().to_string()).or_default() += 1;
      }
      counts
         .into_iter()
         .map(|(word, count)| {
            value::encode(&count)
               .map(|v| (word, v))
               .map_err(|e| ExtractError::new(e.to_string()))
         })
         .collect()
   }
}

/// Declared file type of every file; never reads content.
pub struct FileTypeIndex;

impl IndexExtension for FileTypeIndex {
   fn name(&self) -> &str {
      "filetype"
   }

   fn version(&self) -> u32 {
      1
   }

   fn accepts(&self, _meta: &FileMetadata) -> bool {
      true
   }

   fn extract(&self, input: &IndexInput<'_>) -> Result<KeyValueMap, ExtractError> {
      Ok(KeyValueMap::from([(input.meta.file_type.clone(), Vec::new())]))
   }

   fn depends_on_content(&self) -> bool {
      false
   }
}

pub fn defaults() -> Vec<Arc<dyn IndexExtension>> {
   vec![Arc::new(WordIndex), Arc::new(FileTypeIndex)]
}
