mod support;

use std::{collections::BTreeSet, fs, sync::Arc};

use fbidx::{
   engine::IndexEngine,
   extension::builtin,
   source::{FileSource, LocalFileSource},
   types::SearchScope,
};
use support::test_config;
use tempfile::TempDir;

fn open(root: &TempDir, data: &TempDir) -> (Arc<IndexEngine>, Arc<LocalFileSource>) {
   let source =
      Arc::new(LocalFileSource::open(root.path(), data.path().join("paths.json")).unwrap());
   let dyn_source: Arc<dyn FileSource> = Arc::clone(&source) as Arc<dyn FileSource>;
   let engine = IndexEngine::open(
      data.path().join("store"),
      Arc::new(test_config()),
      dyn_source,
      builtin::defaults(),
   )
   .unwrap();
   (engine, source)
}

#[test]
fn indexes_a_directory_and_follows_rescans() {
   let root = TempDir::new().unwrap();
   let data = TempDir::new().unwrap();
   fs::write(root.path().join("lib.rs"), "pub fn parse_config() {}").unwrap();
   fs::write(root.path().join("README.md"), "parse_config reads the file").unwrap();
   fs::write(root.path().join(".gitignore"), "target/\n").unwrap();
   fs::create_dir(root.path().join("target")).unwrap();
   fs::write(root.path().join("target/out.rs"), "parse_config").unwrap();

   let (engine, source) = open(&root, &data);
   let base = source.root().to_path_buf();
   let hits: BTreeSet<_> = engine
      .get_files_with_key("words", "parse_config", &SearchScope::Everything)
      .unwrap()
      .into_iter()
      .filter_map(|id| source.path_of(id))
      .collect();
   assert_eq!(hits, BTreeSet::from([base.join("lib.rs"), base.join("README.md")]));

   let rust = engine
      .get_files_with_key("filetype", "rs", &SearchScope::Everything)
      .unwrap();
   assert_eq!(rust.len(), 1);

   fs::remove_file(root.path().join("README.md")).unwrap();
   assert!(engine.scan().unwrap() >= 1);
   let hits = engine
      .get_files_with_key("words", "parse_config", &SearchScope::Everything)
      .unwrap();
   assert_eq!(hits.len(), 1);
   engine.shutdown().unwrap();
}

#[test]
fn file_ids_and_data_survive_restart() {
   let root = TempDir::new().unwrap();
   let data = TempDir::new().unwrap();
   fs::write(root.path().join("a.txt"), "stable_token").unwrap();

   let (engine, source) = open(&root, &data);
   let before = engine
      .get_files_with_key("words", "stable_token", &SearchScope::Everything)
      .unwrap();
   engine.shutdown().unwrap();
   drop((engine, source));

   let (engine, _source) = open(&root, &data);
   assert_eq!(engine.tracker().pending_count(), 0);
   let after = engine
      .get_files_with_key("words", "stable_token", &SearchScope::Everything)
      .unwrap();
   assert_eq!(before, after);
   engine.shutdown().unwrap();
}
