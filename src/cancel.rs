//! Cooperative cancellation and suspension shared by indexing workers.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

#[derive(Default)]
struct TokenState {
   cancelled: AtomicBool,
   paused:    Mutex<bool>,
   resumed:   Condvar,
}

/// Cloneable handle observed by every worker before it claims the next
/// file and between the steps of one file.
#[derive(Clone, Default)]
pub struct IndexingToken {
   state: Arc<TokenState>,
}

impl IndexingToken {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn cancel(&self) {
      self.state.cancelled.store(true, Ordering::Release);
      let _guard = self.state.paused.lock();
      self.state.resumed.notify_all();
   }

   pub fn is_cancelled(&self) -> bool {
      self.state.cancelled.load(Ordering::Acquire)
   }

   /// Blocks every subsequent [`Self::checkpoint`] until [`Self::resume`].
   pub fn pause(&self) {
      *self.state.paused.lock() = true;
   }

   pub fn resume(&self) {
      let mut paused = self.state.paused.lock();
      *paused = false;
      self.state.resumed.notify_all();
   }

   /// Waits out a pause, then fails with [`Error::Cancelled`] if the token
   /// was cancelled.
   pub fn checkpoint(&self) -> Result<()> {
      let mut paused = self.state.paused.lock();
      while *paused && !self.is_cancelled() {
         self.state.resumed.wait(&mut paused);
      }
      drop(paused);
      if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
   }
}
