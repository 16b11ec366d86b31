//! `fbidx index`: bring every index up to date with the directory.

use std::path::PathBuf;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{Result, cancel::IndexingToken, cmd};

pub fn execute(path: Option<PathBuf>, json: bool) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, false)?;
   let engine = &local.engine;

   let rebuilt = engine.run_pending_rebuilds()?;
   for index in &rebuilt {
      tracing::info!("rebuilt {index}");
   }

   let mut pb = if json { ProgressBar::hidden() } else { ProgressBar::new(0) };
   if let Ok(bar) = ProgressStyle::default_bar()
      .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
   {
      pb.set_style(bar.progress_chars("█▓░"));
   }
   pb.set_message("indexing");

   let report = engine.index_all(&IndexingToken::new(), &mut pb)?;
   pb.finish_and_clear();
   local.shutdown()?;

   if json {
      println!("{}", serde_json::to_string_pretty(&report)?);
      return Ok(());
   }
   println!(
      "{} {} indexed, {} unchanged, {} removed, {} failed in {:.2?}",
      style("✓").green(),
      report.indexed,
      report.unchanged,
      report.removed,
      report.failed,
      report.elapsed
   );
   Ok(())
}
