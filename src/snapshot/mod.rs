//! Snapshot cache: extraction results keyed by content digest.

pub mod digest;
pub mod store;

pub use digest::{ContentDigest, DigestFlavor};
pub use store::{SnapshotCache, SnapshotStats};
