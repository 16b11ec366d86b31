//! Authoritative set of files that need reindexing.
//!
//! Files move from the merger into `pending`, are claimed into `in_flight`
//! by exactly one worker, and leave once processed. A reader asking for an
//! up-to-date index processes the pending files of its scope inline and
//! waits for in-flight ones claimed by other threads.

use std::{
   cell::Cell,
   collections::{BTreeSet, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::{
   Error, Result,
   cancel::IndexingToken,
   events::{ChangeEventMerger, ChangeFlags},
   registry::IndexRegistry,
   stamp::StampRegistry,
   types::{FileId, SearchScope},
   update::{self, UpdateEngine},
};

thread_local! {
   static ENSURING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Default)]
struct Queue {
   /// Live ids to (re)index and tombstone ids to purge.
   pending:   BTreeSet<FileId>,
   /// Live ids currently being processed.
   in_flight: HashSet<FileId>,
}

impl Queue {
   fn schedule_update(&mut self, file: FileId) {
      self.pending.remove(&file.live().tombstone());
      self.pending.insert(file.live());
   }

   fn schedule_removal(&mut self, file: FileId) {
      self.pending.remove(&file.live());
      self.pending.insert(file.live().tombstone());
   }

   fn claim(
      &mut self,
      scope: &SearchScope,
      limit: usize,
      skip: &HashSet<FileId>,
   ) -> Vec<FileId> {
      let claimable: Vec<FileId> = self
         .pending
         .iter()
         .copied()
         .filter(|f| scope.contains(*f) && !self.in_flight.contains(&f.live()))
         .filter(|f| !skip.contains(f))
         .take(limit)
         .collect();
      for file in &claimable {
         self.pending.remove(file);
         self.in_flight.insert(file.live());
      }
      claimable
   }

   fn busy_in(&self, scope: &SearchScope) -> bool {
      self.in_flight.iter().any(|f| scope.contains(*f))
   }
}

struct EnsureGuard;

impl EnsureGuard {
   fn enter() -> Option<Self> {
      if ENSURING.with(|flag| flag.replace(true)) {
         return None;
      }
      Some(Self)
   }
}

impl Drop for EnsureGuard {
   fn drop(&mut self) {
      ENSURING.with(|flag| flag.set(false));
   }
}

pub struct ChangedFileTracker {
   merger:          Arc<ChangeEventMerger>,
   stamps:          Arc<StampRegistry>,
   registry:        Arc<IndexRegistry>,
   updates:         Arc<UpdateEngine>,
   queue:           Mutex<Queue>,
   released:        Condvar,
   async_threshold: usize,
   async_running:   AtomicBool,
   async_rerun:     AtomicBool,
   async_worker:    Mutex<Option<JoinHandle<()>>>,
   background:      IndexingToken,
}

impl ChangedFileTracker {
   pub fn new(
      merger: Arc<ChangeEventMerger>,
      stamps: Arc<StampRegistry>,
      registry: Arc<IndexRegistry>,
      updates: Arc<UpdateEngine>,
      async_threshold: usize,
   ) -> Self {
      Self {
         merger,
         stamps,
         registry,
         updates,
         queue: Mutex::new(Queue::default()),
         released: Condvar::new(),
         async_threshold: async_threshold.max(1),
         async_running: AtomicBool::new(false),
         async_rerun: AtomicBool::new(false),
         async_worker: Mutex::new(None),
         background: IndexingToken::new(),
      }
   }

   pub fn updates(&self) -> &Arc<UpdateEngine> {
      &self.updates
   }

   /// Moves merged events into the pending set, outdating stamps of files
   /// whose bytes or metadata changed.
   ///
   /// The queue stays locked for the whole drain, so a concurrent reader
   /// never sees an event that has left the merger but not yet reached
   /// `pending`.
   pub fn process_events(&self) -> usize {
      let mut queue = self.queue.lock();
      self.merger.drain(|file, flags| {
         let file = file.live();
         let readded = flags.intersects(ChangeFlags::ADDED | ChangeFlags::CONTENT_CHANGED);
         if flags.contains(ChangeFlags::REMOVED) && !readded {
            queue.schedule_removal(file);
            return true;
         }
         // A removal followed by an add leaves REMOVED|ADDED; the old data
         // is replaced by the update's diff against the forward map.
         if flags.intersects(
            ChangeFlags::REMOVED
               | ChangeFlags::TRANSIENT_STATE_CHANGED
               | ChangeFlags::BEFORE_CONTENT_CHANGE
               | ChangeFlags::CONTENT_CHANGED,
         ) {
            self.stamps.mark_all_outdated(file);
         }
         queue.schedule_update(file);
         true
      })
   }

   pub fn schedule_for_update(&self, file: FileId) {
      self.queue.lock().schedule_update(file);
   }

   pub fn schedule_removal(&self, file: FileId) {
      self.queue.lock().schedule_removal(file);
   }

   pub fn pending_count(&self) -> usize {
      self.queue.lock().pending.len() + self.merger.pending_count()
   }

   /// Tombstones still waiting to be purged.
   pub fn pending_tombstones(&self) -> Vec<FileId> {
      self
         .queue
         .lock()
         .pending
         .iter()
         .copied()
         .filter(|f| f.is_tombstone())
         .collect()
   }

   /// Claims every pending file not already in flight.
   pub fn claim_all(&self) -> Vec<FileId> {
      self.process_events();
      self
         .queue
         .lock()
         .claim(&SearchScope::Everything, usize::MAX, &HashSet::new())
   }

   /// Returns a claimed file after processing.
   pub fn release(&self, file: FileId) {
      self.queue.lock().in_flight.remove(&file.live());
      self.released.notify_all();
   }

   /// Puts a claimed file back, e.g. after cancellation mid-file.
   pub fn requeue(&self, file: FileId) {
      let mut queue = self.queue.lock();
      queue.in_flight.remove(&file.live());
      let superseded = if file.is_tombstone() {
         queue.pending.contains(&file.live())
      } else {
         queue.pending.contains(&file.tombstone())
      };
      if !superseded {
         queue.pending.insert(file);
      }
      drop(queue);
      self.released.notify_all();
   }

   /// Releases or requeues a claimed file according to how [`Self::process`]
   /// went. Returns whether the file is pending again.
   ///
   /// Storage failures and unready indices release the file: the rebuild
   /// they requested reschedules every file. Anything else (a failed read,
   /// a cancelled token) keeps the file dirty.
   pub fn settle(&self, file: FileId, result: &Result<update::FileOutcome>) -> bool {
      match result {
         Ok(_) => {
            self.release(file);
            false
         },
         Err(e) if e.is_storage() || matches!(e, Error::NotReady { .. }) => {
            self.release(file);
            false
         },
         Err(_) => {
            self.requeue(file);
            true
         },
      }
   }

   /// Processes one claimed file: tombstones purge, live ids reindex.
   pub fn process(&self, file: FileId, token: &IndexingToken) -> Result<update::FileOutcome> {
      if file.is_tombstone() {
         self.updates.remove_file(file.live())?;
         return Ok(update::FileOutcome::Removed);
      }
      self.updates.index_file(file, token)
   }

   /// Brings `index` up to date for every file in `scope`. A nested call on
   /// the same thread returns immediately.
   pub fn ensure_up_to_date(&self, index: &str, scope: &SearchScope) -> Result<()> {
      let registered = self.registry.get(index)?;
      registered.ensure_ready()?;
      let Some(_guard) = EnsureGuard::enter() else {
         tracing::debug!("nested ensure_up_to_date for {index}; skipping");
         return Ok(());
      };
      if update::in_update() {
         tracing::debug!("ensure_up_to_date for {index} from inside an update; skipping");
         return Ok(());
      }

      self.process_events();
      let token = IndexingToken::new();
      // Files that failed in this call stay pending for the next one.
      let mut retry_later = HashSet::new();
      loop {
         let claimed = {
            let mut queue = self.queue.lock();
            loop {
               let claimed = queue.claim(scope, 64, &retry_later);
               if !claimed.is_empty() {
                  break claimed;
               }
               if !queue.busy_in(scope) {
                  break Vec::new();
               }
               self.released.wait(&mut queue);
            }
         };
         if claimed.is_empty() {
            break;
         }
         for file in claimed {
            let result = self.process(file, &token);
            if let Err(e) = &result {
               tracing::warn!("failed to bring {file} up to date: {e}");
            }
            if self.settle(file, &result) {
               retry_later.insert(file);
            }
         }
      }
      registered.ensure_ready()
   }

   /// Hands a full drain to the background worker when enough events have
   /// accumulated. Returns whether a drain was requested.
   pub fn maybe_drain_async(self: &Arc<Self>) -> bool {
      if self.merger.pending_count() < self.async_threshold {
         return false;
      }
      self.ensure_up_to_date_async();
      true
   }

   /// Starts the single background drain, or asks the running one to make
   /// another pass.
   pub fn ensure_up_to_date_async(self: &Arc<Self>) {
      self.async_rerun.store(true, Ordering::Release);
      if self
         .async_running
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_err()
      {
         return;
      }
      let tracker = Arc::clone(self);
      let handle = thread::Builder::new()
         .name("fbidx-drain".into())
         .spawn(move || tracker.run_async_drain());
      match handle {
         Ok(handle) => {
            if let Some(previous) = self.async_worker.lock().replace(handle) {
               let _ = previous.join();
            }
         },
         Err(e) => {
            tracing::warn!("failed to spawn drain worker: {e}");
            self.async_running.store(false, Ordering::Release);
         },
      }
   }

   fn run_async_drain(&self) {
      loop {
         self.async_rerun.store(false, Ordering::Release);
         for file in self.claim_all() {
            let result = self.process(file, &self.background);
            if let Err(e) = &result
               && !e.is_cancelled()
            {
               tracing::warn!("background indexing of {file} failed: {e}");
            }
            self.settle(file, &result);
         }
         self.async_running.store(false, Ordering::Release);
         if self.background.is_cancelled() || !self.async_rerun.load(Ordering::Acquire) {
            break;
         }
         if self
            .async_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
         {
            break;
         }
      }
   }

   /// Blocks until the background drain (if any) has finished.
   pub fn wait_async(&self) {
      let handle = self.async_worker.lock().take();
      if let Some(handle) = handle {
         let _ = handle.join();
      }
   }

   /// Cancels and joins the background drain.
   pub fn stop_async(&self) {
      self.background.cancel();
      self.wait_async();
   }
}
