//! `fbidx watch`: keep the indices of a directory current until interrupted.

use std::{path::PathBuf, sync::Arc, time::Duration};

use console::style;

use crate::{Result, cancel::IndexingToken, cmd, watch};

pub fn execute(path: Option<PathBuf>, debounce_ms: u64) -> Result<()> {
   let root = cmd::resolve_root(path)?;
   let local = cmd::open_engine(&root, true)?;
   let engine = Arc::clone(&local.engine);

   let report = engine.index_all(&IndexingToken::new(), &mut ())?;
   println!(
      "{} watching {} ({} files indexed)",
      style("●").green(),
      root.display(),
      report.indexed
   );

   let _watcher =
      watch::watch(&engine, Arc::clone(&local.source), Duration::from_millis(debounce_ms))?;
   let (tx, rx) = crossbeam_channel::bounded::<()>(1);
   stop_on_stdin_close(tx);
   let ticker = crossbeam_channel::tick(engine.config().flush_interval());
   loop {
      crossbeam_channel::select! {
         recv(rx) -> _ => break,
         recv(ticker) -> _ => {
            engine.ensure_up_to_date_async()?;
         },
      }
   }
   drop(engine);
   local.shutdown()
}

/// Stops the loop once stdin closes.
fn stop_on_stdin_close(tx: crossbeam_channel::Sender<()>) {
   std::thread::spawn(move || {
      let mut sink = String::new();
      while std::io::stdin().read_line(&mut sink).is_ok_and(|n| n > 0) {
         sink.clear();
      }
      let _ = tx.send(());
   });
}
