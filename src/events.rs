//! Coalescing of raw file-system events into one pending mask per file.

use std::{collections::HashMap, mem, sync::Arc};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::FileId;

bitflags! {
   #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
   pub struct ChangeFlags: u8 {
      const ADDED = 1;
      const REMOVED = 1 << 1;
      const CONTENT_CHANGED = 1 << 2;
      const BEFORE_CONTENT_CHANGE = 1 << 3;
      const TRANSIENT_STATE_CHANGED = 1 << 4;
   }
}

impl ChangeFlags {
   /// A later removal supersedes everything recorded before it; all other
   /// flags accumulate.
   pub fn merge(self, next: Self) -> Self {
      if next.contains(Self::REMOVED) { Self::REMOVED } else { self | next }
   }
}

/// Notification kinds delivered by the file source.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
   Added,
   Removed,
   ContentChanged,
   MetadataChanged,
}

impl From<ChangeKind> for ChangeFlags {
   fn from(kind: ChangeKind) -> Self {
      match kind {
         ChangeKind::Added => Self::ADDED,
         ChangeKind::Removed => Self::REMOVED,
         ChangeKind::ContentChanged => Self::CONTENT_CHANGED,
         ChangeKind::MetadataChanged => Self::TRANSIENT_STATE_CHANGED,
      }
   }
}

type Invalidator = Arc<dyn Fn(FileId) + Send + Sync>;

#[derive(Default)]
pub struct ChangeEventMerger {
   pending:      Mutex<HashMap<FileId, ChangeFlags>>,
   invalidators: RwLock<Vec<Invalidator>>,
}

impl ChangeEventMerger {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn record(&self, file: FileId, kind: ChangeKind) {
      self.record_flags(file, kind.into());
   }

   pub fn record_flags(&self, file: FileId, flags: ChangeFlags) {
      let mut pending = self.pending.lock();
      let slot = pending.entry(file).or_default();
      *slot = slot.merge(flags);
   }

   /// Registers a hook run synchronously by [`Self::before_content_change`].
   pub fn add_invalidator(&self, hook: impl Fn(FileId) + Send + Sync + 'static) {
      self.invalidators.write().push(Arc::new(hook));
   }

   /// Announces that `file`'s bytes are about to change. Transient state is
   /// invalidated before this returns.
   pub fn before_content_change(&self, file: FileId) {
      let hooks = self.invalidators.read().clone();
      for hook in hooks {
         hook(file);
      }
      self.record_flags(file, ChangeFlags::BEFORE_CONTENT_CHANGE);
   }

   pub fn pending_count(&self) -> usize {
      self.pending.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.pending.lock().is_empty()
   }

   /// Hands every pending file to `visitor` exactly once and removes it.
   /// Concurrent drains each get a disjoint share. A visitor returning
   /// `false` stops the drain; the rest is merged back.
   pub fn drain(&self, mut visitor: impl FnMut(FileId, ChangeFlags) -> bool) -> usize {
      let taken = mem::take(&mut *self.pending.lock());
      let mut visited = 0;
      let mut rest = taken.into_iter();
      for (file, flags) in rest.by_ref() {
         visited += 1;
         if !visitor(file, flags) {
            break;
         }
      }
      let leftover: Vec<_> = rest.collect();
      if !leftover.is_empty() {
         let mut pending = self.pending.lock();
         for (file, flags) in leftover {
            // Anything recorded since the take is newer.
            let slot = pending.entry(file).or_default();
            *slot = flags.merge(*slot);
         }
      }
      visited
   }
}
