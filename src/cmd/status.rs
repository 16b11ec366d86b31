//! `fbidx status`: per-index state of a directory's data root.

use std::path::PathBuf;

use console::style;

use crate::{
   Result, cmd,
   registry::RebuildState,
   util::{format_size, get_dir_size},
};

pub fn execute(path: Option<PathBuf>, json: bool) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, false)?;
   let status = local.engine.status();
   let size = get_dir_size(local.engine.root());
   local.shutdown()?;

   if json {
      println!("{}", serde_json::to_string_pretty(&status)?);
      return Ok(());
   }

   println!("{}", style("fbidx status").bold());
   println!(
      "  {} {} ({})",
      style("data:").dim(),
      status.data_root.display(),
      format_size(size)
   );
   println!(
      "  {} {} tracked, {} pending",
      style("files:").dim(),
      status.tracked_files,
      status.pending_files
   );
   println!(
      "  {} {} hits, {} misses, {} writes",
      style("snapshots:").dim(),
      status.snapshots.hits,
      status.snapshots.misses,
      status.snapshots.writes
   );
   println!();
   for index in &status.indices {
      let symbol = match index.state {
         RebuildState::Ok => style("●").green(),
         RebuildState::RequiresRebuild => style("●").yellow(),
         RebuildState::DoingRebuild => style("●").cyan(),
      };
      println!(
         "  {} {} {}",
         symbol,
         style(&index.name).bold(),
         style(format!(
            "({}, {}, {} keys{})",
            index.state,
            index.version,
            index.keys,
            if index.buffering { ", buffering" } else { "" }
         ))
         .dim()
      );
      println!("      {} {}", style("startup:").dim(), index.startup);
   }
   Ok(())
}
