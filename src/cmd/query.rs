//! `fbidx query`, `fbidx files` and `fbidx data`: read an index.

use std::{
   collections::BTreeMap,
   io,
   path::{Path, PathBuf},
};

use console::style;

use crate::{
   Result, cmd,
   types::{FileId, SearchScope},
};

/// Values stored under `key`, one line per value.
pub fn values(index: &str, key: &str, path: Option<PathBuf>, json: bool) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, false)?;
   let values = local.engine.get_values(index, key, &SearchScope::Everything)?;
   local.shutdown()?;

   if json {
      let hex: Vec<String> = values.iter().map(hex::encode).collect();
      println!("{}", serde_json::to_string_pretty(&hex)?);
      return Ok(());
   }
   if values.is_empty() {
      println!("{}", style("no values").dim());
   }
   for value in values {
      match std::str::from_utf8(&value) {
         Ok(text) if !text.chars().any(char::is_control) => println!("{text}"),
         _ => println!("{}", hex::encode(&value)),
      }
   }
   Ok(())
}

/// Files carrying every one of `keys`.
pub fn files(index: &str, keys: &[String], path: Option<PathBuf>, json: bool) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, false)?;
   let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
   let files = local
      .engine
      .get_files_containing_all_keys(index, &keys, &SearchScope::Everything)?;
   let paths: Vec<String> = files
      .into_iter()
      .filter_map(|id| local.source.path_of(id))
      .map(|p| display_relative(&p, local.source.root()))
      .collect();
   local.shutdown()?;

   if json {
      println!("{}", serde_json::to_string_pretty(&paths)?);
   } else {
      for path in paths {
         println!("{path}");
      }
   }
   Ok(())
}

/// Everything `file` contributes to `index`.
pub fn data(index: &str, file: &Path, path: Option<PathBuf>, json: bool) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let file = file.canonicalize()?;
   let local = cmd::open_engine(&root, false)?;
   let id: FileId = local.source.lookup(&file).ok_or_else(|| {
      io::Error::new(
         io::ErrorKind::NotFound,
         format!("{} is not part of {}", file.display(), root.display()),
      )
   })?;
   let data = local.engine.get_file_data(index, id)?;
   local.shutdown()?;

   if json {
      let map: BTreeMap<_, _> =
         data.iter().map(|(k, v)| (k.clone(), hex::encode(v))).collect();
      println!("{}", serde_json::to_string_pretty(&map)?);
      return Ok(());
   }
   for (key, value) in &data {
      println!("{key}\t{}", style(hex::encode(value)).dim());
   }
   Ok(())
}

fn display_relative(path: &Path, root: &Path) -> String {
   path.strip_prefix(root).unwrap_or(path).display().to_string()
}
