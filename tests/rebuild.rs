mod support;

use std::{
   collections::BTreeSet,
   sync::Arc,
   thread,
   time::{Duration, Instant},
};

use fbidx::{
   Error,
   registry::{RebuildState, VersionDiff},
   source::MemoryFileSource,
   types::SearchScope,
};
use support::{CountingIndex, open_engine, open_with, test_config};
use tempfile::TempDir;

#[test]
fn index_under_rebuild_refuses_reads_until_rebuilt() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "value");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();

   assert!(engine.request_rebuild("words", "test").unwrap());
   assert!(!engine.request_rebuild("words", "again").unwrap(), "already requested");

   let err = engine
      .get_values("words", "value", &SearchScope::Everything)
      .unwrap_err();
   assert!(matches!(err, Error::NotReady { state: RebuildState::RequiresRebuild, .. }));

   let rebuilt = engine.run_pending_rebuilds().unwrap();
   assert_eq!(rebuilt.len(), 1);
   assert_eq!(engine.registry().get("words").unwrap().rebuild.get(), RebuildState::Ok);

   let files = engine
      .get_files_with_key("words", "value", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));
   assert!(engine.run_pending_rebuilds().unwrap().is_empty());
   engine.shutdown().unwrap();
}

#[test]
fn rebuild_leaves_other_indices_alone() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "shared");
   let (broken, _) = CountingIndex::new("broken", 1).into_arc();
   let (healthy, healthy_calls) = CountingIndex::new("healthy", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![broken, healthy]);
   engine.ensure_up_to_date("healthy", &SearchScope::Everything).unwrap();

   engine.request_rebuild("broken", "test").unwrap();
   let files = engine
      .get_files_with_key("healthy", "shared", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));

   engine.run_pending_rebuilds().unwrap();
   engine.ensure_up_to_date("broken", &SearchScope::Everything).unwrap();
   assert_eq!(
      healthy_calls.load(std::sync::atomic::Ordering::SeqCst),
      1,
      "the healthy index keeps its data"
   );
   assert!(engine.stamp(a, "healthy").unwrap().is_up_to_date());
   engine.shutdown().unwrap();
}

#[test]
fn shutdown_clears_indices_still_awaiting_rebuild() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "value");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   engine.request_rebuild("words", "test").unwrap();
   engine.shutdown().unwrap();
   drop(engine);

   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   let (_, diff) = engine.diffs()[0].clone();
   assert_eq!(diff, VersionDiff::InitialBuild);
   let files = engine
      .get_files_with_key("words", "value", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));
   engine.shutdown().unwrap();
}

#[test]
fn background_maintenance_runs_requested_rebuilds() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "value");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let config = fbidx::config::Config { background_maintenance: true, ..test_config() };
   let engine = open_with(dir.path(), &source, vec![words], config);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   engine.request_rebuild("words", "test").unwrap();

   let deadline = Instant::now() + Duration::from_secs(10);
   while engine.registry().get("words").unwrap().rebuild.get() != RebuildState::Ok {
      assert!(Instant::now() < deadline, "rebuild never ran");
      thread::sleep(Duration::from_millis(10));
   }
   let files = engine
      .get_files_with_key("words", "value", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));
   engine.shutdown().unwrap();
}
