//! `fbidx rebuild`: discard one index (or all) and reindex from scratch.

use std::path::PathBuf;

use console::style;

use crate::{Result, cancel::IndexingToken, cmd};

pub fn execute(index: Option<String>, path: Option<PathBuf>) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, false)?;
   let engine = &local.engine;

   let names: Vec<String> = match index {
      Some(name) => vec![name],
      None => engine.registry().ids().iter().map(ToString::to_string).collect(),
   };
   for name in &names {
      engine.request_rebuild(name, "requested from the command line")?;
   }
   let rebuilt = engine.run_pending_rebuilds()?;
   let report = engine.index_all(&IndexingToken::new(), &mut ())?;
   local.shutdown()?;

   for id in rebuilt {
      println!("{} rebuilt {}", style("✓").green(), id);
   }
   println!("  {} files indexed, {} failed", report.indexed, report.failed);
   Ok(())
}
