//! Configuration management for worker pools, locking, flushing, and paths.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const MAX_FILE_SIZE_BYTES_CAP: u64 = 10_485_760;
pub const MAX_LOCK_STRIPES: usize = 1024;

/// Engine configuration loaded from config files and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   /// Overrides `~/.fbidx/data/<store-id>` as the storage root.
   pub data_dir: Option<PathBuf>,

   pub indexing_threads:    usize,
   pub max_threads:         usize,
   pub foreground_headroom: usize,

   pub stamp_lock_stripes: usize,
   pub file_lock_stripes:  usize,

   pub flush_interval_ms:      u64,
   pub background_maintenance: bool,
   pub async_drain_threshold:  usize,

   pub max_file_size_bytes:  u64,
   pub max_buffered_keys:    usize,
   pub snapshot_hot_entries: u64,

   pub rebuild_max_retries: u32,
   pub rebuild_backoff_ms:  u64,

   pub strict_invariants: bool,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         data_dir:               None,
         indexing_threads:       0,
         max_threads:            32,
         foreground_headroom:    4,
         stamp_lock_stripes:     16,
         file_lock_stripes:      64,
         flush_interval_ms:      5000,
         background_maintenance: true,
         async_drain_threshold:  20,
         max_file_size_bytes:    MAX_FILE_SIZE_BYTES_CAP,
         max_buffered_keys:      100_000,
         snapshot_hot_entries:   4096,
         rebuild_max_retries:    5,
         rebuild_backoff_ms:     50,
         strict_invariants:      cfg!(debug_assertions),
      }
   }
}

impl Config {
   /// Defaults, then `~/.fbidx/config.toml`, then `<root>/.fbidx.toml`, then
   /// `FBIDX_*` environment variables.
   pub fn load_with_root(root: &Path) -> Self {
      let config_path = ensure_global_config();

      let mut figment =
         Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(config_path));

      let repo_path = repo_config_path(root);
      if repo_path.exists() {
         figment = figment.merge(Toml::file(repo_path));
      }

      figment
         .merge(Env::prefixed("FBIDX_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      let default_config = Self::default();
      if let Ok(toml) = toml::to_string_pretty(&default_config) {
         let _ = fs::write(path, toml);
      }
   }

   /// Calculates default thread count based on available CPUs
   pub fn default_threads(&self) -> usize {
      num_cpus::get()
         .saturating_sub(self.foreground_headroom)
         .clamp(1, self.max_threads.max(1))
   }

   /// Worker count for bulk indexing; `0` in the config means automatic.
   pub fn indexing_threads(&self) -> usize {
      if self.indexing_threads == 0 {
         self.default_threads()
      } else {
         self.indexing_threads.clamp(1, self.max_threads.max(1))
      }
   }

   pub fn effective_max_file_size_bytes(&self) -> u64 {
      self.max_file_size_bytes.min(MAX_FILE_SIZE_BYTES_CAP)
   }

   pub fn effective_stamp_stripes(&self) -> usize {
      self.stamp_lock_stripes.clamp(1, MAX_LOCK_STRIPES)
   }

   pub fn effective_file_stripes(&self) -> usize {
      self.file_lock_stripes.clamp(1, MAX_LOCK_STRIPES)
   }

   pub const fn flush_interval(&self) -> Duration {
      Duration::from_millis(self.flush_interval_ms)
   }

   pub const fn rebuild_backoff(&self) -> Duration {
      Duration::from_millis(self.rebuild_backoff_ms)
   }

   pub fn validate(&self) -> Result<()> {
      if self.max_file_size_bytes > MAX_FILE_SIZE_BYTES_CAP {
         return Err(
            ConfigError::Invalid(format!(
               "max_file_size_bytes {} exceeds hard cap {}",
               self.max_file_size_bytes, MAX_FILE_SIZE_BYTES_CAP
            ))
            .into(),
         );
      }
      if self.flush_interval_ms == 0 {
         return Err(ConfigError::Invalid("flush_interval_ms must be positive".into()).into());
      }
      if self.max_buffered_keys == 0 {
         return Err(ConfigError::Invalid("max_buffered_keys must be positive".into()).into());
      }
      Ok(())
   }
}

/// Initializes config using a root-level `.fbidx.toml` if present.
pub fn init_for_root(root: &Path) -> &'static Config {
   let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
   CONFIG.get_or_init(|| Config::load_with_root(&root))
}

/// Returns the base directory for fbidx data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".fbidx"))
}

fn ensure_global_config() -> PathBuf {
   let config_path = config_file_path();
   if !config_path.exists() {
      Config::create_default_config(config_path);
   }
   config_path.to_path_buf()
}

pub fn repo_config_path(root: &Path) -> PathBuf {
   root.join(".fbidx.toml")
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   data_dir: "data",
}
