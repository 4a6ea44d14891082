//! First-writer-wins failure slot shared by all units of one operation
//!
//! Invariants:
//! - At most one failure is ever retained; records after the first are dropped.
//! - Neither `is_set` nor `get` ever waits on a writer or another reader.
//! - Once set, the slot stays set, even after the failure has been taken out.

use crate::error::SlotError;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Shared container through which one unit's terminal failure becomes visible to the others.
pub trait FailureSlot<E>: Send + Sync {
    /// Record `failure` unless one is already held. Returns `Ok(true)` if this call won.
    fn record(&self, failure: E) -> Result<bool, SlotError>;

    /// Whether a failure has been recorded.
    fn is_set(&self) -> bool;

    /// Move the recorded failure out.
    fn take(&self) -> Option<E>;
}

/// Default [`FailureSlot`]. The value lives in an [`ArcSwapOption`], so readers never block.
///
/// `claimed` picks the single winner, `set` is published once the value is in place.
pub struct ErrorSlot<E> {
    claimed: AtomicBool,
    set: AtomicBool,
    failure: ArcSwapOption<E>,
}

impl<E> ErrorSlot<E> {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            set: AtomicBool::new(false),
            failure: ArcSwapOption::from(None),
        }
    }

    /// Clone of the recorded failure, if any. `None` again once the failure was taken.
    pub fn get(&self) -> Option<E>
    where
        E: Clone,
    {
        self.failure.load_full().map(|failure| E::clone(&failure))
    }
}

impl<E> Default for ErrorSlot<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ErrorSlot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSlot").field("set", &self.set.load(Ordering::Acquire)).finish()
    }
}

impl<E: Send + Sync> FailureSlot<E> for ErrorSlot<E> {
    fn record(&self, failure: E) -> Result<bool, SlotError> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.failure.store(Some(Arc::new(failure)));
        self.set.store(true, Ordering::Release);
        Ok(true)
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<E> {
        let mut failure = self.failure.swap(None)?;
        // A concurrent `get` may still hold a reference while it clones.
        loop {
            match Arc::try_unwrap(failure) {
                Ok(failure) => return Some(failure),
                Err(shared) => {
                    failure = shared;
                    thread::yield_now();
                }
            }
        }
    }
}
