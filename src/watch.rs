//! Feeds file-system notifications for a [`LocalFileSource`] root into an
//! engine as change events.

use std::{
   path::{Component, Path},
   sync::Arc,
   time::Duration,
};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};

use crate::{
   Result,
   engine::IndexEngine,
   events::ChangeKind,
   source::LocalFileSource,
   types::FileId,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the OS watcher alive; dropping it stops event delivery.
pub struct SourceWatcher {
   _debouncer: Debouncer<RecommendedWatcher>,
}

/// Watches the root of `source` recursively. Every debounced path is turned
/// into a change event on `engine`.
pub fn watch(
   engine: &Arc<IndexEngine>,
   source: Arc<LocalFileSource>,
   debounce: Duration,
) -> Result<SourceWatcher> {
   let root = source.root().to_path_buf();
   let engine = Arc::downgrade(engine);
   let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| {
      let Some(engine) = engine.upgrade() else {
         return;
      };
      let events = match result {
         Ok(events) => events,
         Err(e) => {
            tracing::warn!("watcher error: {e}");
            return;
         },
      };
      for event in events {
         for (file, kind) in classify(&source, &event.path) {
            tracing::debug!("{} -> {file} {kind:?}", event.path.display());
            if let Err(e) = engine.record_event(file, kind) {
               tracing::debug!("dropping watch event: {e}");
               return;
            }
            if kind == ChangeKind::Removed {
               source.forget(file);
            }
         }
      }
   })?;
   debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
   tracing::info!("watching {}", root.display());
   Ok(SourceWatcher { _debouncer: debouncer })
}

fn is_vcs_path(path: &Path) -> bool {
   path.components().any(|c| c == Component::Normal(".git".as_ref()))
}

/// Maps one notified path to change events. A vanished directory reports a
/// removal for every known file below it.
fn classify(source: &LocalFileSource, path: &Path) -> Vec<(FileId, ChangeKind)> {
   if is_vcs_path(path) {
      return Vec::new();
   }
   match path.metadata() {
      Ok(meta) if meta.is_file() => match source.lookup(path) {
         Some(id) => vec![(id, ChangeKind::ContentChanged)],
         None => match source.id_for_path(path) {
            Ok(id) => vec![(id, ChangeKind::Added)],
            Err(e) => {
               tracing::debug!("ignoring {}: {e}", path.display());
               Vec::new()
            },
         },
      },
      Ok(_) => Vec::new(),
      Err(_) => match source.lookup(path) {
         Some(id) => vec![(id, ChangeKind::Removed)],
         None => source
            .ids_under(path)
            .into_iter()
            .map(|id| (id, ChangeKind::Removed))
            .collect(),
      },
   }
}

#[cfg(test)]
mod tests {
   use std::fs;

   use tempfile::TempDir;

   use super::*;

   #[test]
   fn classifies_added_changed_and_removed_paths() {
      let root = TempDir::new().unwrap();
      let data = TempDir::new().unwrap();
      fs::create_dir(root.path().join("dir")).unwrap();
      fs::write(root.path().join("dir/a.txt"), "alpha").unwrap();
      let source = LocalFileSource::open(root.path(), data.path().join("paths.json")).unwrap();
      let base = source.root().to_path_buf();
      let a = base.join("dir/a.txt");

      let added = classify(&source, &a);
      assert_eq!(added.len(), 1);
      assert_eq!(added[0].1, ChangeKind::Added);
      let id = added[0].0;

      assert_eq!(classify(&source, &a), vec![(id, ChangeKind::ContentChanged)]);

      fs::remove_dir_all(base.join("dir")).unwrap();
      assert_eq!(classify(&source, &base.join("dir")), vec![(id, ChangeKind::Removed)]);
      assert!(classify(&source, &base.join(".git/index")).is_empty());
   }
}
