//! Content digests keying the snapshot cache.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::source::FileMetadata;

const DIGEST_DOMAIN: &[u8] = b"fbidx-content-digest-v1\0";

/// How a file's bytes are normalized into a digest.
///
/// Both flavors are byte-exact. `Text` also mixes in the declared charset,
/// so identical bytes under different charsets produce different digests.
/// The salt separates extensions that want private cache entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DigestFlavor {
   Text { salt: &'static str },
   Binary { salt: &'static str },
}

impl DigestFlavor {
   pub const fn for_file(meta: &FileMetadata) -> Self {
      if meta.is_binary { Self::Binary { salt: "" } } else { Self::Text { salt: "" } }
   }

   pub fn digest(self, meta: &FileMetadata, bytes: &[u8]) -> ContentDigest {
      let mut hasher = Sha256::new();
      hasher.update(DIGEST_DOMAIN);
      let salt = match self {
         Self::Text { salt } => {
            hasher.update(b"text\0");
            hasher.update(meta.charset.as_bytes());
            hasher.update(b"\0");
            salt
         },
         Self::Binary { salt } => {
            hasher.update(b"binary\0");
            salt
         },
      };
      hasher.update(salt.as_bytes());
      hasher.update(b"\0");
      hasher.update(meta.file_type.as_bytes());
      hasher.update(b"\0");
      hasher.update((bytes.len() as u64).to_le_bytes());
      hasher.update(bytes);
      ContentDigest(hasher.finalize().into())
   }
}

/// SHA-256 over content plus everything that changes its interpretation.
#[derive(Serialize, Deserialize, Copy, Clone, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
   pub const fn new(hash: [u8; 32]) -> Self {
      Self(hash)
   }
}

impl AsRef<[u8]> for ContentDigest {
   fn as_ref(&self) -> &[u8] {
      &self.0
   }
}

impl fmt::Display for ContentDigest {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}", hex::encode(self.0))
   }
}

impl fmt::Debug for ContentDigest {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "Digest({})", hex::encode(&self.0[..8]))
   }
}
