//! Fan a flaky operation out over a small pool and watch the retry budget absorb failures.
//!
//! Run with `RUST_LOG=taskstream=debug cargo run --example retry_fanout` to see each retry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use taskstream::{Failure, StreamError, TaskStream, WorkerPool};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("connection reset while fetching {0}")]
    Reset(u32),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== taskstream: retry fan-out ===\n");
    let pool = WorkerPool::new(4)?;

    // The first attempt at every third page fails; a budget of 2 recovers all of them.
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let failed_once = Mutex::new(HashSet::new());
    let mut stream = TaskStream::builder(0..12_u32).pool(pool.clone()).retries(2).build()?;
    stream.try_for_each_parallel(move |page: &u32| {
        counted.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        if *page % 3 == 0 && failed_once.lock().unwrap_or_else(PoisonError::into_inner).insert(*page) {
            return Err(Failure::Declared(FetchError::Reset(*page)));
        }
        Ok(())
    })?;
    stream.close()?;
    println!("12 pages fetched in {} attempts", attempts.load(Ordering::SeqCst));

    // Page 7 never recovers: the first terminal failure is handed back, in-flight pages finish.
    let mut stream = TaskStream::builder(0..12_u32).pool(pool.clone()).retries(1).build()?;
    match stream.try_for_each_parallel(|page: &u32| {
        std::thread::sleep(Duration::from_millis(20));
        if *page == 7 {
            return Err(Failure::Declared(FetchError::Reset(*page)));
        }
        Ok(())
    }) {
        Err(StreamError::Declared(err)) => println!("stopped: {}", err),
        Err(other) => return Err(other.into()),
        Ok(()) => println!("unexpectedly completed"),
    }
    stream.close()?;

    pool.shutdown(taskstream::DEFAULT_SHUTDOWN_GRACE)?;
    Ok(())
}
