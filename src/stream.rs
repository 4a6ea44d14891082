//! `TaskStream`: an iterator bound to a worker pool, a retry budget, and pool ownership
//!
//! Two kinds of operations:
//! - intermediate (`map_joining`, `try_map_joining`): lazy, consume the stream by value and
//!   return a new one sharing the same pool, budget, and ownership;
//! - terminal (`for_each_parallel`, `try_for_each_parallel`): eager, drain the source and
//!   leave the stream in place so it can be closed.
//!
//! Disposal drops the source first, then shuts the pool down if this stream owns it. It runs
//! exactly once: through [`TaskStream::close`], or on drop (including unwinding) otherwise.
//!
//! Example
//! ```rust
//! use taskstream::{Failure, TaskStream};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("flaky")]
//! struct Flaky;
//!
//! let doubled: Result<Vec<u32>, _> = TaskStream::builder(1..=4_u32)
//!     .retries(2)
//!     .owns_pool(true)
//!     .build()
//!     .unwrap()
//!     .try_map_joining(|i: &u32| Ok::<_, Failure<Flaky>>(i * 2))
//!     .into_iter()
//!     .collect();
//! assert_eq!(doubled.unwrap(), vec![2, 4, 6, 8]);
//! ```

use crate::error::{CloseError, ExecutionError, Failure, PoolError, StreamError};
use crate::pool::{WorkerPool, DEFAULT_SHUTDOWN_GRACE};
use crate::retry::RetryExecutor;
use crate::runner::{self, Infallible, JoinStage, Retrying, Source};
use crate::slot::{ErrorSlot, FailureSlot};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Dispatch look-ahead per worker when no explicit window is configured.
pub const DEFAULT_WINDOW_PER_WORKER: usize = 4;

/// Errors produced while building a stream.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The dispatch window must be > 0.
    #[error("window must be > 0 (got {0})")]
    InvalidWindow(usize),
    /// The default pool could not be started.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Pool reference plus the decision whether disposing it is ours to do.
struct PoolLease {
    pool: WorkerPool,
    owned: bool,
    grace: Duration,
}

impl PoolLease {
    /// Shut the pool down if owned. Idempotent: ownership is given up on the first call.
    fn release(&mut self) -> Result<(), PoolError> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        self.pool.shutdown(self.grace)
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "failed to release owned worker pool");
        }
    }
}

/// Iterator wrapper exposing parallel map/for-each with retry over a worker pool.
pub struct TaskStream<T> {
    // Field order is drop order: the source is released before the pool.
    source: Source<T>,
    lease: PoolLease,
    retries: usize,
    window: usize,
}

impl<T> fmt::Debug for TaskStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStream")
            .field("pool", &self.lease.pool)
            .field("owns_pool", &self.lease.owned)
            .field("retries", &self.retries)
            .field("window", &self.window)
            .finish()
    }
}

impl<T: Send + 'static> TaskStream<T> {
    /// Wrap `items` with a fresh pool sized to the hardware parallelism, no retries, and pool
    /// ownership, so disposing the stream shuts that pool down.
    pub fn of<I>(items: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::builder(items).owns_pool(true).build()
    }

    /// Configure pool, retry budget, and ownership explicitly.
    pub fn builder<I>(items: I) -> TaskStreamBuilder<T>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        TaskStreamBuilder::new(Box::new(items.into_iter().map(Ok)))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.lease.pool
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn owns_pool(&self) -> bool {
        self.lease.owned
    }

    /// Maximum number of dispatched units waiting to be joined.
    pub fn window(&self) -> usize {
        self.window
    }

    fn with_source<R>(self, source: Source<R>) -> TaskStream<R> {
        let TaskStream { source: _, lease, retries, window } = self;
        TaskStream { source, lease, retries, window }
    }

    fn drain(&mut self) -> Source<T> {
        std::mem::replace(&mut self.source, Box::new(std::iter::empty()))
    }

    /// Apply `map` to every item on the pool and join results in input order. Lazy.
    ///
    /// A panicking `map` surfaces as [`ExecutionError::Panicked`] when consumed.
    pub fn map_joining<R, F>(mut self, map: F) -> TaskStream<R>
    where
        F: Fn(T) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let stage =
            JoinStage::new(self.drain(), Infallible::new(map), self.lease.pool.clone(), self.window);
        self.with_source(Box::new(stage))
    }

    /// Apply a fallible `operation` to every item on the pool with the stream's retry budget,
    /// joining results in input order. Lazy.
    ///
    /// When consumed, a declared failure that exhausted its retries ends the sequence with
    /// [`ExecutionError::Deferred`] carrying that failure; an undeclared one ends it with
    /// [`ExecutionError::Unexpected`]. Items that failed are never yielded.
    pub fn try_map_joining<R, E, F>(mut self, operation: F) -> TaskStream<R>
    where
        F: Fn(&T) -> Result<R, Failure<E>> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        R: Send + 'static,
    {
        let executor: RetryExecutor<E> = RetryExecutor::new(self.retries, Arc::new(ErrorSlot::new()));
        let stage = JoinStage::new(
            self.drain(),
            Retrying::new(executor, operation),
            self.lease.pool.clone(),
            self.window,
        );
        self.with_source(Box::new(stage))
    }

    /// Run `action` for every item on the pool and wait for all of them.
    pub fn for_each_parallel<F>(&mut self, action: F) -> Result<(), ExecutionError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let source = self.drain();
        runner::drive(source, Infallible::new(action), &self.lease.pool, self.window)
    }

    /// Run a fallible `action` for every item on the pool with the stream's retry budget and
    /// wait for all dispatched units.
    ///
    /// Returns the first declared failure that exhausted its retries as
    /// [`StreamError::Declared`]. Undeclared failures, panics, and pool errors take precedence
    /// as [`StreamError::Execution`]. Work already running is never interrupted.
    pub fn try_for_each_parallel<E, F>(&mut self, action: F) -> Result<(), StreamError<E>>
    where
        F: Fn(&T) -> Result<(), Failure<E>> + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let slot: Arc<ErrorSlot<E>> = Arc::new(ErrorSlot::new());
        let executor = RetryExecutor::new(self.retries, slot.clone());
        let source = self.drain();
        runner::drive(source, Retrying::new(executor, action), &self.lease.pool, self.window)?;
        match slot.take() {
            Some(failure) => Err(StreamError::Declared(failure)),
            None => Ok(()),
        }
    }

    /// Dispose the stream now and report pool shutdown failures.
    pub fn close(self) -> Result<(), CloseError> {
        let TaskStream { source, mut lease, .. } = self;
        drop(source);
        lease.release()?;
        Ok(())
    }
}

impl<T: Send + 'static> IntoIterator for TaskStream<T> {
    type Item = Result<T, ExecutionError>;
    type IntoIter = TaskIter<T>;

    fn into_iter(self) -> TaskIter<T> {
        let TaskStream { source, lease, .. } = self;
        TaskIter { source, lease }
    }
}

/// Consuming iterator over a stream's results. Disposes the stream's resources when dropped.
pub struct TaskIter<T> {
    source: Source<T>,
    lease: PoolLease,
}

impl<T> fmt::Debug for TaskIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskIter")
            .field("pool", &self.lease.pool)
            .field("owns_pool", &self.lease.owned)
            .finish()
    }
}

impl<T> TaskIter<T> {
    /// Dispose now and report pool shutdown failures.
    pub fn close(self) -> Result<(), CloseError> {
        let TaskIter { source, mut lease } = self;
        drop(source);
        lease.release()?;
        Ok(())
    }
}

impl<T> Iterator for TaskIter<T> {
    type Item = Result<T, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next()
    }
}

/// Builder for [`TaskStream`].
pub struct TaskStreamBuilder<T> {
    source: Source<T>,
    pool: Option<WorkerPool>,
    retries: usize,
    owns_pool: bool,
    window: Option<usize>,
    shutdown_grace: Duration,
}

impl<T> fmt::Debug for TaskStreamBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskStreamBuilder")
            .field("pool", &self.pool)
            .field("retries", &self.retries)
            .field("owns_pool", &self.owns_pool)
            .field("window", &self.window)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl<T: Send + 'static> TaskStreamBuilder<T> {
    fn new(source: Source<T>) -> Self {
        Self {
            source,
            pool: None,
            retries: 0,
            owns_pool: false,
            window: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Pool to run on. Defaults to a new pool sized to the hardware parallelism.
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Additional attempts per item after a declared failure. Negative values mean none.
    pub fn retries(mut self, retries: i64) -> Self {
        self.retries = usize::try_from(retries.max(0)).unwrap_or(usize::MAX);
        self
    }

    /// Whether disposing the stream shuts the pool down. Defaults to `false`.
    pub fn owns_pool(mut self, owns: bool) -> Self {
        self.owns_pool = owns;
        self
    }

    /// Maximum dispatched-but-unjoined units per stage. Must be > 0.
    /// Defaults to `DEFAULT_WINDOW_PER_WORKER` times the pool size.
    pub fn window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    /// How long an owning stream waits for running units when shutting its pool down.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<TaskStream<T>, BuildError> {
        if self.window == Some(0) {
            return Err(BuildError::InvalidWindow(0));
        }
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::with_available_parallelism()?,
        };
        let window = self
            .window
            .unwrap_or_else(|| pool.workers().saturating_mul(DEFAULT_WINDOW_PER_WORKER));
        Ok(TaskStream {
            source: self.source,
            lease: PoolLease { pool, owned: self.owns_pool, grace: self.shutdown_grace },
            retries: self.retries,
            window,
        })
    }
}
