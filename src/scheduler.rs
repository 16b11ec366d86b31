//! Bulk (re)indexing of a large backlog on a bounded worker pool.

use std::{
   sync::atomic::{AtomicUsize, Ordering},
   thread,
   time::{Duration, Instant},
};

use crossbeam_channel::unbounded;
use indicatif::ProgressBar;
use serde::Serialize;

use crate::{
   Result,
   cancel::IndexingToken,
   tracker::ChangedFileTracker,
   types::FileId,
   update::FileOutcome,
};

/// Progress of one bulk pass.
#[derive(Debug, Clone, Copy)]
pub struct IndexingProgress {
   pub processed: usize,
   pub total:     usize,
   pub current:   Option<FileId>,
}

/// Trait for receiving indexing progress updates
pub trait IndexingProgressCallback: Send {
   fn progress(&mut self, progress: IndexingProgress);
}

impl<F: FnMut(IndexingProgress) + Send> IndexingProgressCallback for F {
   fn progress(&mut self, progress: IndexingProgress) {
      self(progress);
   }
}

impl IndexingProgressCallback for () {
   fn progress(&mut self, _progress: IndexingProgress) {}
}

impl IndexingProgressCallback for ProgressBar {
   fn progress(&mut self, progress: IndexingProgress) {
      self.update(|state| {
         state.set_len(progress.total as u64);
         state.set_pos(progress.processed as u64);
      });
      if let Some(file) = progress.current {
         self.set_message(format!("file {file}"));
      }
   }
}

/// Summary of a bulk pass.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexingReport {
   pub processed: usize,
   pub indexed:   usize,
   pub unchanged: usize,
   pub removed:   usize,
   /// Files that failed; they stay pending unless their index needs a rebuild.
   pub failed:    usize,
   pub requeued:  usize,
   pub cancelled: bool,
   #[serde(with = "millis")]
   pub elapsed:   Duration,
}

mod millis {
   use std::time::Duration;

   use serde::Serializer;

   pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
      s.serialize_u64(d.as_millis() as u64)
   }
}

enum Tally {
   Indexed,
   Unchanged,
   Removed,
   Failed,
   Requeued,
}

pub struct ParallelIndexingScheduler {
   threads: usize,
}

impl ParallelIndexingScheduler {
   pub fn new(threads: usize) -> Self {
      Self { threads: threads.max(1) }
   }

   pub const fn threads(&self) -> usize {
      self.threads
   }

   /// Processes `files`, which the caller must already have claimed from
   /// `tracker`. Workers observe `token` before claiming each file and
   /// inside each file; a file interrupted by cancellation and every file
   /// never started go back to the pending set.
   pub fn run(
      &self,
      tracker: &ChangedFileTracker,
      files: &[FileId],
      token: &IndexingToken,
      callback: &mut dyn IndexingProgressCallback,
   ) -> Result<IndexingReport> {
      let started = Instant::now();
      let total = files.len();
      let mut report = IndexingReport::default();
      if total == 0 {
         return Ok(report);
      }

      let pool = rayon::ThreadPoolBuilder::new()
         .num_threads(self.threads.min(total))
         .thread_name(|i| format!("fbidx-index-{i}"))
         .build()?;
      let cursor = AtomicUsize::new(0);
      let (tx, rx) = unbounded::<(FileId, Tally)>();

      thread::scope(|scope| {
         scope.spawn(|| {
            pool.scope(|workers| {
               for _ in 0..pool.current_num_threads() {
                  let tx = tx.clone();
                  let cursor = &cursor;
                  workers.spawn(move |_| {
                     while token.checkpoint().is_ok() {
                        let next = cursor.fetch_add(1, Ordering::AcqRel);
                        let Some(&file) = files.get(next) else {
                           break;
                        };
                        let result = tracker.process(file, token);
                        tracker.settle(file, &result);
                        let tally = match result {
                           Ok(FileOutcome::Indexed { .. }) => Tally::Indexed,
                           Ok(FileOutcome::Unchanged) => Tally::Unchanged,
                           Ok(FileOutcome::Removed) => Tally::Removed,
                           Err(e) if e.is_cancelled() => Tally::Requeued,
                           Err(e) => {
                              tracing::warn!("indexing {file} failed: {e}");
                              Tally::Failed
                           },
                        };
                        if tx.send((file, tally)).is_err() {
                           break;
                        }
                     }
                  });
               }
            });
            drop(tx);
         });

         for (file, tally) in &rx {
            report.processed += 1;
            match tally {
               Tally::Indexed => report.indexed += 1,
               Tally::Unchanged => report.unchanged += 1,
               Tally::Removed => report.removed += 1,
               Tally::Failed => report.failed += 1,
               Tally::Requeued => report.requeued += 1,
            }
            callback.progress(IndexingProgress {
               processed: report.processed,
               total,
               current: Some(file),
            });
         }
      });

      let claimed = cursor.load(Ordering::Acquire).min(total);
      for &file in &files[claimed..] {
         tracker.requeue(file);
         report.requeued += 1;
      }
      report.cancelled = token.is_cancelled();
      report.elapsed = started.elapsed();
      tracing::info!(
         "indexed {} of {total} files in {:?} ({} failed, {} requeued)",
         report.indexed,
         report.elapsed,
         report.failed,
         report.requeued
      );
      Ok(report)
   }
}
