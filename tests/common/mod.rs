#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// Declared failure kind used across the integration tests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("test exception: {0}")]
pub struct TestError(pub String);

impl TestError {
    pub fn new(msg: impl Into<String>) -> Self {
        TestError(msg.into())
    }
}

/// Claims one of `limit` failure tickets; `true` while tickets remain. Never exceeds `limit`.
pub fn claim_failure(counter: &AtomicUsize, limit: usize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n < limit { Some(n + 1) } else { None })
        .is_ok()
}

/// Records which threads ran units.
#[derive(Debug, Clone, Default)]
pub struct ThreadLog(Arc<Mutex<HashSet<ThreadId>>>);

impl ThreadLog {
    pub fn record(&self) {
        self.0.lock().unwrap().insert(thread::current().id());
    }

    pub fn distinct(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Installs a test subscriber once so `RUST_LOG=taskstream=debug` shows retries.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
