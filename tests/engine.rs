mod support;

use std::{
   collections::BTreeSet,
   io,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use bytes::Bytes;
use fbidx::{
   Error,
   cancel::IndexingToken,
   engine::IndexEngine,
   events::ChangeKind,
   source::{FileMetadata, FileSource, MemoryFileSource},
   stamp::Stamp,
   types::{FileId, SearchScope},
};
use support::{CountingIndex, FAIL_MARKER, TypeIndex, count, open_engine, test_config};
use tempfile::TempDir;

#[test]
fn queries_see_every_file_after_open() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "hello world hello");
   let b = source.add("b.txt", "world");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let values = engine
      .get_values("words", "hello", &SearchScope::Everything)
      .unwrap();
   assert_eq!(values.iter().map(|v| count(v)).collect::<Vec<_>>(), vec![2]);

   let files = engine
      .get_files_with_key("words", "world", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a, b]));

   let both = engine
      .get_files_containing_all_keys("words", &["hello", "world"], &SearchScope::Everything)
      .unwrap();
   assert_eq!(both, BTreeSet::from([a]));
   assert!(
      engine
         .get_files_containing_all_keys("words", &[], &SearchScope::Everything)
         .unwrap()
         .is_empty()
   );

   assert!(matches!(engine.stamp(a, "words").unwrap(), Stamp::UpToDate(_)));
   engine.shutdown().unwrap();
}

#[test]
fn content_changes_replace_old_keys() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "alpha beta");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();

   source.set_content(a, "beta gamma");
   engine.record_event(a, ChangeKind::ContentChanged).unwrap();

   let data = engine.get_file_data("words", a).unwrap();
   assert_eq!(data.keys().map(String::as_str).collect::<Vec<_>>(), vec!["beta", "gamma"]);
   assert!(
      engine
         .get_files_with_key("words", "alpha", &SearchScope::Everything)
         .unwrap()
         .is_empty()
   );
   engine.shutdown().unwrap();
}

#[test]
fn removed_files_disappear_from_every_index() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.rs", "shared");
   let b = source.add("b.rs", "shared");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words, Arc::new(TypeIndex)]);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   engine.ensure_up_to_date("types", &SearchScope::Everything).unwrap();

   source.remove(a);
   engine.record_event(a, ChangeKind::Removed).unwrap();

   let words = engine
      .get_files_with_key("words", "shared", &SearchScope::Everything)
      .unwrap();
   assert_eq!(words, BTreeSet::from([b]));
   let types = engine
      .get_files_with_key("types", "rs", &SearchScope::Everything)
      .unwrap();
   assert_eq!(types, BTreeSet::from([b]));
   assert_eq!(engine.stamp(a, "words").unwrap(), Stamp::NotIndexed);
   assert!(!engine.stamps().files().contains(&a));
   engine.shutdown().unwrap();
}

#[test]
fn scope_limits_work_and_results() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "key");
   let b = source.add("b.txt", "key other");
   let (words, extractions) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let scope = SearchScope::files([a]);
   let files = engine.get_files_with_key("words", "key", &scope).unwrap();
   assert_eq!(files, BTreeSet::from([a]));
   assert_eq!(extractions.load(Ordering::SeqCst), 1, "only the scoped file is indexed");
   assert_eq!(engine.stamp(b, "words").unwrap(), Stamp::NotIndexed);

   let keys = engine.all_keys("words", &SearchScope::Everything).unwrap();
   assert_eq!(keys, vec!["key".to_string(), "other".to_string()]);
   assert_eq!(extractions.load(Ordering::SeqCst), 2);
   engine.shutdown().unwrap();
}

#[test]
fn content_less_index_never_reads_bytes() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("main.rs", "fn main() {}");
   source.add("notes.md", "# notes");
   let engine = open_engine(dir.path(), &source, vec![Arc::new(TypeIndex)]);

   let rs = engine
      .get_files_with_key("types", "rs", &SearchScope::Everything)
      .unwrap();
   assert_eq!(rs, BTreeSet::from([a]));
   let mut seen = Vec::new();
   let complete = engine
      .process_all_keys("types", &SearchScope::Everything, |key| {
         seen.push(key.to_string());
         true
      })
      .unwrap();
   assert!(complete);
   seen.sort();
   assert_eq!(seen, vec!["md", "rs"]);
   engine.shutdown().unwrap();
}

#[test]
fn failed_extraction_is_not_retried_until_the_file_changes() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let bad = source.add("bad.txt", format!("oops {FAIL_MARKER}"));
   let good = source.add("good.txt", "oops");
   let (words, extractions) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let files = engine
      .get_files_with_key("words", "oops", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([good]));
   assert!(engine.stamps().is_failed(bad, &"words".into()));
   let after_first = extractions.load(Ordering::SeqCst);

   engine.record_event(bad, ChangeKind::MetadataChanged).unwrap();
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   assert!(extractions.load(Ordering::SeqCst) > after_first, "a change clears the failure");

   let retried = extractions.load(Ordering::SeqCst);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   assert_eq!(extractions.load(Ordering::SeqCst), retried);

   source.set_content(bad, "oops fixed");
   engine.record_event(bad, ChangeKind::ContentChanged).unwrap();
   let files = engine
      .get_files_with_key("words", "oops", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([bad, good]));
   assert!(!engine.stamps().is_failed(bad, &"words".into()));
   engine.shutdown().unwrap();
}

#[test]
fn reset_failed_requeues_the_file() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let bad = source.add("bad.txt", FAIL_MARKER);
   let (words, extractions) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   assert_eq!(extractions.load(Ordering::SeqCst), 1);

   assert!(engine.reset_failed(bad).unwrap());
   engine.ensure_up_to_date("words", &SearchScope::Everything).unwrap();
   assert_eq!(extractions.load(Ordering::SeqCst), 2);
   assert!(!engine.reset_failed(FileId::new(9999)).unwrap());
   engine.shutdown().unwrap();
}

#[test]
fn bulk_indexing_reports_and_then_finds_nothing_to_do() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   for i in 0..40 {
      source.add(format!("f{i}.txt"), format!("word{i} common"));
   }
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let report = engine.index_all(&IndexingToken::new(), &mut ()).unwrap();
   assert_eq!(report.processed, 40);
   assert_eq!(report.indexed, 40);
   assert!(!report.cancelled);

   assert_eq!(engine.scan().unwrap(), 0);
   let again = engine.index_all(&IndexingToken::new(), &mut ()).unwrap();
   assert_eq!(again.processed, 0);
   engine.shutdown().unwrap();
}

#[test]
fn unknown_index_and_shutdown_are_reported() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let err = engine
      .get_values("nope", "k", &SearchScope::Everything)
      .unwrap_err();
   assert!(matches!(err, Error::UnknownIndex(_)));

   engine.shutdown().unwrap();
   engine.shutdown().unwrap();
   assert!(engine.is_shut_down());
   let err = engine
      .get_values("words", "k", &SearchScope::Everything)
      .unwrap_err();
   assert!(matches!(err, Error::ShutDown));
}

#[test]
fn second_engine_on_the_same_root_is_refused() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);

   let (again, _) = CountingIndex::new("words", 1).into_arc();
   let source_dyn: Arc<dyn fbidx::source::FileSource> = source.clone();
   let err = fbidx::engine::IndexEngine::open(
      dir.path(),
      Arc::new(support::test_config()),
      source_dyn,
      vec![again],
   )
   .err()
   .expect("locked");
   assert!(matches!(err, Error::Locked(_)));
   engine.shutdown().unwrap();
}

#[test]
fn id_removed_and_added_again_is_indexed_with_new_content() {
   let dir = TempDir::new().unwrap();
   let source = Arc::new(MemoryFileSource::new());
   let a = source.add("a.txt", "alpha");
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine = open_engine(dir.path(), &source, vec![words]);
   let files = engine
      .get_files_with_key("words", "alpha", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));

   engine.record_event(a, ChangeKind::Removed).unwrap();
   source.set_content(a, "beta");
   engine.record_event(a, ChangeKind::Added).unwrap();

   let files = engine
      .get_files_with_key("words", "beta", &SearchScope::Everything)
      .unwrap();
   assert_eq!(files, BTreeSet::from([a]));
   assert!(
      engine
         .get_files_with_key("words", "alpha", &SearchScope::Everything)
         .unwrap()
         .is_empty()
   );
   let data = engine.get_file_data("words", a).unwrap();
   assert_eq!(data.keys().collect::<Vec<_>>(), vec!["beta"]);
   assert!(engine.stamp(a, "words").unwrap().is_up_to_date());
   engine.shutdown().unwrap();
}

/// Fails the first `failures` content reads, then delegates.
struct FlakySource {
   inner:    Arc<MemoryFileSource>,
   failures: AtomicUsize,
}

impl FileSource for FlakySource {
   fn files(&self) -> fbidx::Result<Vec<FileId>> {
      self.inner.files()
   }

   fn metadata(&self, id: FileId) -> fbidx::Result<Option<FileMetadata>> {
      self.inner.metadata(id)
   }

   fn content(&self, id: FileId) -> fbidx::Result<Bytes> {
      let failing = self
         .failures
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
         .is_ok();
      if failing {
         return Err(Error::Io(io::Error::other("device busy")));
      }
      self.inner.content(id)
   }
}

#[test]
fn transient_read_failure_keeps_the_file_pending() {
   let dir = TempDir::new().unwrap();
   let inner = Arc::new(MemoryFileSource::new());
   let a = inner.add("a.txt", "gamma");
   let source = Arc::new(FlakySource { inner, failures: AtomicUsize::new(1) });
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   let engine =
      IndexEngine::open(dir.path(), Arc::new(test_config()), source, vec![words]).unwrap();

   let first = engine
      .get_files_with_key("words", "gamma", &SearchScope::Everything)
      .unwrap();
   assert!(first.is_empty());
   assert_eq!(engine.tracker().pending_count(), 1);
   assert_eq!(engine.stamp(a, "words").unwrap(), Stamp::NotIndexed);

   let second = engine
      .get_files_with_key("words", "gamma", &SearchScope::Everything)
      .unwrap();
   assert_eq!(second, BTreeSet::from([a]));
   assert_eq!(engine.tracker().pending_count(), 0);
   engine.shutdown().unwrap();
}
