//! Incremental, crash-tolerant indexing of a mutating file set into many
//! independently versioned inverted indices.
//!
//! The entry point is [`engine::IndexEngine`]. Hosts supply a
//! [`source::FileSource`] and a set of [`extension::IndexExtension`]s, feed
//! file-system events in, and query the indices back out.

pub mod cancel;
pub mod cmd;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod extension;
pub mod identity;
pub mod lock;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod source;
pub mod stamp;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod update;
pub mod util;
pub mod watch;

pub use error::{Error, Result};
