//! Per-index rebuild state machine: `Ok -> RequiresRebuild -> DoingRebuild -> Ok`.

use std::fmt;

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU8, Ordering};
use serde::Serialize;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RebuildState {
   Ok = 0,
   RequiresRebuild = 1,
   DoingRebuild = 2,
}

impl RebuildState {
   const fn from_u8(raw: u8) -> Self {
      match raw {
         0 => Self::Ok,
         1 => Self::RequiresRebuild,
         _ => Self::DoingRebuild,
      }
   }
}

impl fmt::Display for RebuildState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(match self {
         Self::Ok => "ok",
         Self::RequiresRebuild => "requires rebuild",
         Self::DoingRebuild => "rebuilding",
      })
   }
}

#[derive(Debug)]
pub struct RebuildStatus {
   state: AtomicU8,
}

impl Default for RebuildStatus {
   fn default() -> Self {
      Self { state: AtomicU8::new(RebuildState::Ok as u8) }
   }
}

impl RebuildStatus {
   pub fn get(&self) -> RebuildState {
      RebuildState::from_u8(self.state.load(Ordering::Acquire))
   }

   pub fn is_ok(&self) -> bool {
      self.get() == RebuildState::Ok
   }

   fn transition(&self, from: RebuildState, to: RebuildState) -> bool {
      self
         .state
         .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
         .is_ok()
   }

   /// `Ok -> RequiresRebuild`. Exactly one of any number of racing callers
   /// gets `true`.
   pub fn request(&self) -> bool {
      self.transition(RebuildState::Ok, RebuildState::RequiresRebuild)
   }

   /// `RequiresRebuild -> DoingRebuild`; claims the rebuild.
   pub fn begin(&self) -> bool {
      self.transition(RebuildState::RequiresRebuild, RebuildState::DoingRebuild)
   }

   /// `DoingRebuild -> Ok`.
   pub fn finish(&self) -> bool {
      self.transition(RebuildState::DoingRebuild, RebuildState::Ok)
   }

   /// `DoingRebuild -> RequiresRebuild` after the clear kept failing.
   pub fn abandon(&self) -> bool {
      self.transition(RebuildState::DoingRebuild, RebuildState::RequiresRebuild)
   }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
   use std::{
      sync::{
         Arc,
         atomic::{AtomicUsize, Ordering as AtomicOrdering},
      },
      thread,
   };

   use super::*;

   #[test]
   fn full_cycle() {
      let status = RebuildStatus::default();
      assert!(!status.begin());
      assert!(status.request());
      assert!(!status.request());
      assert_eq!(status.get(), RebuildState::RequiresRebuild);
      assert!(status.begin());
      assert!(!status.begin());
      assert!(status.abandon());
      assert!(status.begin());
      assert!(status.finish());
      assert!(status.is_ok());
   }

   #[test]
   fn concurrent_requests_win_once() {
      let status = Arc::new(RebuildStatus::default());
      let wins = Arc::new(AtomicUsize::new(0));
      let handles: Vec<_> = (0..8)
         .map(|_| {
            let status = Arc::clone(&status);
            let wins = Arc::clone(&wins);
            thread::spawn(move || {
               if status.request() {
                  wins.fetch_add(1, AtomicOrdering::SeqCst);
               }
            })
         })
         .collect();
      for h in handles {
         h.join().unwrap();
      }
      assert_eq!(wins.load(AtomicOrdering::SeqCst), 1);
   }
}
