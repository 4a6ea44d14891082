//! Fixed-size worker pool backed by a dedicated tokio runtime
//!
//! Units run on the runtime's blocking pool, capped at `workers` threads, so at most `workers`
//! units execute at once no matter how many are queued. Clones share one pool.
//!
//! Lifecycle: `shutdown` stops accepting work and waits up to a grace period for running units.
//! Units that never started are dropped; units still running after the grace period are
//! detached and reported through [`PoolError::ShutdownTimedOut`].

use crate::error::PoolError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Grace period used by owning streams when they shut their pool down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

const DEFAULT_THREAD_NAME: &str = "taskstream-worker";

/// Number of workers matching the hardware parallelism, or 1 if it cannot be queried.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Cheaply cloneable handle to a bounded worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runtime: Mutex<Option<Runtime>>,
    shut_down: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    workers: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.inner.workers)
            .field("in_flight", &self.in_flight())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Decrements the in-flight counter when a unit finishes, panics, or is dropped unrun.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        InFlight(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    /// Pool with exactly `workers` threads.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        Self::builder().workers(workers).build()
    }

    /// Pool sized to the available hardware parallelism.
    pub fn with_available_parallelism() -> Result<Self, PoolError> {
        Self::new(available_parallelism())
    }

    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.inner.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured number of worker threads.
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Units dispatched and not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Queue `unit` for execution on a worker thread.
    pub fn spawn<F, R>(&self, unit: F) -> Result<JoinHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let runtime = self.runtime();
        let runtime = runtime.as_ref().ok_or(PoolError::ShutDown)?;
        let guard = InFlight::enter(&self.inner.in_flight);
        Ok(runtime.spawn_blocking(move || {
            let _guard = guard;
            unit()
        }))
    }

    /// Stop accepting work and wait up to `grace` for running units to finish.
    ///
    /// Must be called from synchronous code. From inside an async runtime the pool is released
    /// in the background and [`PoolError::AsyncContext`] is returned.
    pub fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
        let runtime = self.runtime().take().ok_or(PoolError::ShutDown)?;
        self.inner.shut_down.store(true, Ordering::Release);

        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
            tracing::warn!(workers = self.inner.workers, "worker pool shut down from async context");
            return Err(PoolError::AsyncContext);
        }

        runtime.shutdown_timeout(grace);
        let in_flight = self.in_flight();
        if in_flight > 0 {
            tracing::warn!(in_flight, ?grace, "worker pool grace period elapsed");
            return Err(PoolError::ShutdownTimedOut { in_flight });
        }
        tracing::info!(workers = self.inner.workers, "worker pool shut down");
        Ok(())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let runtime = self.runtime.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(runtime) = runtime {
            // Never block in drop; running units are detached.
            runtime.shutdown_background();
        }
    }
}

/// Builder for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    workers: usize,
    thread_name: String,
}

impl WorkerPoolBuilder {
    pub fn new() -> Self {
        Self { workers: available_parallelism(), thread_name: DEFAULT_THREAD_NAME.to_string() }
    }

    /// Number of worker threads. Must be > 0.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Name given to worker threads.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        if self.workers == 0 {
            return Err(PoolError::InvalidWorkers(0));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.workers)
            .thread_name(self.thread_name)
            .build()
            .map_err(PoolError::Start)?;
        tracing::debug!(workers = self.workers, "worker pool started");
        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                runtime: Mutex::new(Some(runtime)),
                shut_down: AtomicBool::new(false),
                in_flight: Arc::new(AtomicUsize::new(0)),
                workers: self.workers,
            }),
        })
    }
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
