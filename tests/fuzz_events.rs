mod support;

use std::{
   collections::{BTreeMap, BTreeSet},
   sync::Arc,
};

use fbidx::{
   engine::IndexEngine,
   events::ChangeKind,
   source::MemoryFileSource,
   types::{FileId, SearchScope},
};
use proptest::{
   prelude::*,
   test_runner::{Config, RngAlgorithm, TestRng, TestRunner},
};
use support::{CountingIndex, count, open_engine};
use tempfile::TempDir;

#[derive(Clone, Debug)]
enum Op {
   Write { name: String, word: u8 },
   Delete { name: String },
   Touch { name: String },
   Query,
   Restart,
}

fn file_name() -> impl Strategy<Value = String> {
   (0usize..5).prop_map(|i| format!("file{i}.txt"))
}

fn op_strategy() -> impl Strategy<Value = Op> {
   prop_oneof![
      4 => (file_name(), 0u8..4).prop_map(|(name, word)| Op::Write { name, word }),
      2 => file_name().prop_map(|name| Op::Delete { name }),
      1 => file_name().prop_map(|name| Op::Touch { name }),
      2 => Just(Op::Query),
      1 => Just(Op::Restart),
   ]
}

fn content_for(word: u8) -> String {
   format!("common w{word} w{word}")
}

fn open(dir: &TempDir, source: &Arc<MemoryFileSource>) -> Arc<IndexEngine> {
   let (words, _) = CountingIndex::new("words", 1).into_arc();
   open_engine(dir.path(), source, vec![words])
}

/// Replays `ops` against a live engine and checks the index against the
/// source contents at the end.
fn replay(ops: Vec<Op>) -> Result<(), TestCaseError> {
   let dir = TempDir::new().expect("data dir");
   let source = Arc::new(MemoryFileSource::new());
   let mut engine = open(&dir, &source);
   let mut live: BTreeMap<String, (FileId, u8)> = BTreeMap::new();

   for op in ops {
      match op {
         Op::Write { name, word } => {
            if let Some((id, _)) = live.get(&name).copied() {
               engine.before_content_change(id).expect("announce");
               source.set_content(id, content_for(word));
               engine
                  .record_event(id, ChangeKind::ContentChanged)
                  .expect("record change");
               // duplicate notifications merge into one update
               engine
                  .record_event(id, ChangeKind::ContentChanged)
                  .expect("record change");
               live.insert(name, (id, word));
            } else {
               let id = source.add(name.clone(), content_for(word));
               engine.record_event(id, ChangeKind::Added).expect("record add");
               live.insert(name, (id, word));
            }
         },
         Op::Delete { name } => {
            if let Some((id, _)) = live.remove(&name) {
               source.remove(id);
               engine.record_event(id, ChangeKind::Removed).expect("record removal");
            }
         },
         Op::Touch { name } => {
            if let Some((id, _)) = live.get(&name) {
               engine
                  .record_event(*id, ChangeKind::MetadataChanged)
                  .expect("record metadata");
            }
         },
         Op::Query => {
            engine
               .get_files_with_key("words", "common", &SearchScope::Everything)
               .expect("query");
         },
         Op::Restart => {
            engine.shutdown().expect("shutdown");
            drop(engine);
            engine = open(&dir, &source);
         },
      }
   }

   let expected: BTreeSet<FileId> = live.values().map(|(id, _)| *id).collect();
   let common = engine
      .get_files_with_key("words", "common", &SearchScope::Everything)
      .expect("final query");
   prop_assert_eq!(&common, &expected);

   for (name, (id, word)) in &live {
      let data = engine.get_file_data("words", *id).expect("file data");
      let keys: BTreeSet<&str> = data.keys().map(String::as_str).collect();
      let own = format!("w{word}");
      prop_assert_eq!(keys, BTreeSet::from(["common", own.as_str()]), "{}", name);
      prop_assert_eq!(count(&data[&own]), 2);
   }

   let index = engine.registry().get("words").expect("registered");
   prop_assert_eq!(index.storage.indexed_files(), expected);
   engine.shutdown().expect("shutdown");
   Ok(())
}

#[test]
fn random_event_streams_match_the_source() {
   let config = Config { cases: 16, max_shrink_iters: 0, ..Config::default() };
   let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &[42u8; 32]);
   let mut runner = TestRunner::new_with_rng(config, rng);
   runner
      .run(&prop::collection::vec(op_strategy(), 1..40), replay)
      .expect("event replay diverged");
}
