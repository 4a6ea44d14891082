#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # taskstream
//!
//! Parallel map/for-each over plain iterators, on a bounded worker pool, with per-item retry
//! and first-failure-wins error reporting.
//!
//! ## Features
//!
//! - **Ordered joining**: `map_joining` runs every item on the pool and yields results in input order
//! - **Per-item retry**: declared failures are retried immediately up to a budget
//! - **Soft cancellation**: once one item exhausts its retries, no new items are dispatched
//! - **Typed failures**: `Failure::Declared` is retried and reported as-is, `Failure::Undeclared` is not
//! - **Pool ownership**: a stream can own its pool and shut it down when disposed
//!
//! ## Quick Start
//!
//! ```rust
//! use taskstream::{Failure, StreamError, TaskStream, WorkerPool};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("cannot process {0}")]
//! struct ProcessError(u32);
//!
//! let pool = WorkerPool::new(4).unwrap();
//! let mut stream = TaskStream::builder(0..100_u32)
//!     .pool(pool.clone())
//!     .retries(3)
//!     .build()
//!     .unwrap();
//!
//! let result = stream.try_for_each_parallel(|item: &u32| {
//!     if *item == 42 {
//!         return Err(Failure::Declared(ProcessError(*item)));
//!     }
//!     Ok(())
//! });
//! assert!(matches!(result, Err(StreamError::Declared(ProcessError(42)))));
//!
//! // the stream borrowed the pool, so it stays usable
//! stream.close().unwrap();
//! assert!(!pool.is_shut_down());
//! ```
//!
//! All operations block the calling thread. Call them from synchronous code, not from inside an
//! async task.

pub mod error;
pub mod pool;
pub mod retry;
mod runner;
pub mod slot;
pub mod stream;

// Re-exports
pub use error::{BoxError, CloseError, ExecutionError, Failure, PoolError, SlotError, StreamError};
pub use pool::{WorkerPool, WorkerPoolBuilder, DEFAULT_SHUTDOWN_GRACE};
pub use retry::{Outcome, RetryExecutor};
pub use slot::{ErrorSlot, FailureSlot};
pub use stream::{BuildError, TaskIter, TaskStream, TaskStreamBuilder};
