//! Per-index version marker and the startup version diff.

use std::{fmt, fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, stamp::CreationStamp, util};

/// Layout version of everything the engine writes for an index.
pub const FORMAT_VERSION: u32 = 1;

pub const VERSION_FILE: &str = "version.json";

/// The three inputs whose change invalidates an index.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct EffectiveVersion {
   pub declared:   u32,
   pub format:     u32,
   pub generation: u64,
}

impl fmt::Display for EffectiveVersion {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}.f{}.g{}", self.declared, self.format, self.generation)
   }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VersionFile {
   pub version:        EffectiveVersion,
   pub creation_stamp: CreationStamp,
   pub written_at:     DateTime<Utc>,
}

impl VersionFile {
   pub fn new(version: EffectiveVersion, creation_stamp: CreationStamp) -> Self {
      Self { version, creation_stamp, written_at: Utc::now() }
   }

   /// `Ok(None)` when the file does not exist; decode failures are errors.
   pub fn load(dir: &Path) -> Result<Option<Self>> {
      match fs::read(dir.join(VERSION_FILE)) {
         Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
         Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
         Err(e) => Err(e.into()),
      }
   }

   pub fn save(&self, dir: &Path) -> Result<()> {
      let data = serde_json::to_vec_pretty(self)?;
      util::write_atomic(&dir.join(VERSION_FILE), &data)
   }
}

/// Outcome of registering an index against what the previous run left.
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionDiff {
   UpToDate,
   InitialBuild,
   VersionChanged { old: EffectiveVersion, new: EffectiveVersion },
   CorruptedRebuild,
}

impl VersionDiff {
   pub fn compute(previous: Result<Option<VersionFile>>, current: EffectiveVersion) -> Self {
      match previous {
         Ok(None) => Self::InitialBuild,
         Ok(Some(file)) if file.version == current => Self::UpToDate,
         Ok(Some(file)) => Self::VersionChanged { old: file.version, new: current },
         Err(e) => {
            tracing::warn!("unreadable version marker: {e}");
            Self::CorruptedRebuild
         },
      }
   }

   pub const fn requires_rebuild(self) -> bool {
      !matches!(self, Self::UpToDate)
   }
}

impl fmt::Display for VersionDiff {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::UpToDate => f.write_str("up to date"),
         Self::InitialBuild => f.write_str("initial build"),
         Self::VersionChanged { old, new } => write!(f, "version changed {old} -> {new}"),
         Self::CorruptedRebuild => f.write_str("corrupted, rebuilding"),
      }
   }
}
