//! Per-item retry executor
//!
//! Semantics:
//! - `retries` counts additional attempts after the first; total attempts are `retries + 1`.
//! - Only `Failure::Declared` is retried, immediately and on the same thread (no backoff).
//! - `Failure::Undeclared` is returned as [`ExecutionError::Unexpected`] without retry.
//! - A declared failure that exhausts the budget is recorded in the shared slot and the item
//!   becomes [`Outcome::Absent`].
//! - If the slot already holds a failure when the unit starts, the operation is not called.
//!
//! Invariants:
//! - Attempts never exceed `retries + 1`.
//! - An absent item never yields a value.

use crate::error::{ExecutionError, Failure};
use crate::slot::{ErrorSlot, FailureSlot};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of one dispatched unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<R> {
    /// The operation produced a value.
    Produced(R),
    /// The item failed terminally or was skipped after another item failed.
    Absent,
}

impl<R> Outcome<R> {
    pub fn is_produced(&self) -> bool {
        matches!(self, Self::Produced(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn into_option(self) -> Option<R> {
        match self {
            Self::Produced(value) => Some(value),
            Self::Absent => None,
        }
    }
}

/// Runs one item through a fallible operation with an immediate retry loop.
pub struct RetryExecutor<E, S = ErrorSlot<E>> {
    retries: usize,
    slot: Arc<S>,
    _failure: PhantomData<fn() -> E>,
}

impl<E, S> fmt::Debug for RetryExecutor<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("retries", &self.retries)
            .field("slot", &"<slot>")
            .finish()
    }
}

impl<E, S> Clone for RetryExecutor<E, S> {
    fn clone(&self) -> Self {
        Self { retries: self.retries, slot: self.slot.clone(), _failure: PhantomData }
    }
}

impl<E, S> RetryExecutor<E, S>
where
    E: std::error::Error + Send + Sync + 'static,
    S: FailureSlot<E>,
{
    pub fn new(retries: usize, slot: Arc<S>) -> Self {
        Self { retries, slot, _failure: PhantomData }
    }

    /// Additional attempts allowed after the first failure.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// The slot shared with every other unit of the same operation.
    pub fn slot(&self) -> &Arc<S> {
        &self.slot
    }

    /// Apply `operation` to `item`, retrying declared failures up to the budget.
    pub fn execute<T, R, F>(&self, item: &T, operation: F) -> Result<Outcome<R>, ExecutionError>
    where
        F: Fn(&T) -> Result<R, Failure<E>>,
    {
        if self.slot.is_set() {
            tracing::trace!("failure already recorded; skipping item");
            return Ok(Outcome::Absent);
        }

        let mut remaining = self.retries;
        loop {
            match operation(item) {
                Ok(value) => return Ok(Outcome::Produced(value)),
                Err(Failure::Undeclared(err)) => {
                    tracing::debug!(error = %err, "undeclared failure; not retrying");
                    return Err(ExecutionError::Unexpected(err));
                }
                Err(Failure::Declared(err)) if remaining > 0 => {
                    remaining -= 1;
                    tracing::debug!(
                        error = %err,
                        attempt = self.retries - remaining,
                        remaining,
                        "declared failure; retrying"
                    );
                }
                Err(Failure::Declared(err)) => {
                    tracing::warn!(error = %err, attempts = self.retries + 1, "retries exhausted");
                    return match self.slot.record(err) {
                        Ok(_) => Ok(Outcome::Absent),
                        Err(slot_err) => Err(ExecutionError::Unexpected(Box::new(slot_err))),
                    };
                }
            }
        }
    }
}
