//! Error types for parallel task execution
//!
//! Failures are split by who can see them:
//! - [`Failure`] is what a user operation returns. `Declared(E)` is the kind the caller opted
//!   into retrying; `Undeclared` is everything else and is never retried.
//! - [`StreamError`] is returned by the eager `try_for_each_parallel`, where the declared type is
//!   still in scope and is handed back unwrapped.
//! - [`ExecutionError`] is yielded by lazy pipelines. A declared failure arrives there as
//!   [`ExecutionError::Deferred`], boxed, with the original failure as its `source()`.
use std::any::Any;
use std::fmt;

/// Boxed, thread-safe error used for undeclared failures and deferred causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result of a single attempt of a user operation.
#[derive(Debug)]
pub enum Failure<E> {
    /// The failure kind the caller declared as expected; eligible for retry.
    Declared(E),
    /// Any other failure. Never retried, always fatal for the whole execution.
    Undeclared(BoxError),
}

impl<E> From<E> for Failure<E> {
    fn from(err: E) -> Self {
        Failure::Declared(err)
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declared(e) => write!(f, "{}", e),
            Self::Undeclared(e) => write!(f, "undeclared failure: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Failure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Declared(e) => Some(e),
            Self::Undeclared(e) => Some(e.as_ref()),
        }
    }
}

impl<E> Failure<E> {
    /// Wrap any error as undeclared.
    pub fn undeclared<X>(err: X) -> Self
    where
        X: Into<BoxError>,
    {
        Failure::Undeclared(err.into())
    }

    /// Check if this failure is of the declared kind.
    pub fn is_declared(&self) -> bool {
        matches!(self, Self::Declared(_))
    }

    /// Get the declared failure if present.
    pub fn into_declared(self) -> Option<E> {
        match self {
            Self::Declared(e) => Some(e),
            Self::Undeclared(_) => None,
        }
    }
}

impl<E> Failure<E>
where
    E: std::error::Error + 'static,
{
    /// Sort a boxed error by runtime type: `E` becomes `Declared`, anything else `Undeclared`.
    ///
    /// Useful when the operation calls into code that only hands back `Box<dyn Error>`.
    pub fn classify(err: BoxError) -> Self {
        match err.downcast::<E>() {
            Ok(declared) => Failure::Declared(*declared),
            Err(other) => Failure::Undeclared(other),
        }
    }
}

/// Errors produced by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool no longer accepts work.
    #[error("worker pool is shut down")]
    ShutDown,
    /// A pool needs at least one worker.
    #[error("worker count must be > 0 (got {0})")]
    InvalidWorkers(usize),
    /// The underlying runtime could not be started.
    #[error("failed to start worker pool: {0}")]
    Start(#[source] std::io::Error),
    /// Shutdown returned while units were still running.
    #[error("worker pool shutdown grace period elapsed with {in_flight} unit(s) still running")]
    ShutdownTimedOut { in_flight: usize },
    /// Shutdown was requested from inside an async runtime; the pool was released in the
    /// background without waiting.
    #[error("worker pool shut down from an async context; in-flight work was not awaited")]
    AsyncContext,
}

/// A failure slot refused to record a failure.
#[derive(Debug, thiserror::Error)]
#[error("failure slot rejected record: {0}")]
pub struct SlotError(#[source] pub BoxError);

impl SlotError {
    pub fn new<X>(err: X) -> Self
    where
        X: Into<BoxError>,
    {
        SlotError(err.into())
    }
}

/// Failure surfaced while consuming a lazy pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// A declared failure exhausted its retries. The cause is the declared failure itself.
    #[error("deferred failure: {0}")]
    Deferred(#[source] BoxError),
    /// An operation failed with an undeclared kind, or recording a failure failed.
    #[error("unexpected failure: {0}")]
    Unexpected(#[source] BoxError),
    /// An operation panicked on a worker.
    #[error("worker panicked: {0}")]
    Panicked(String),
    /// The pool refused or dropped work.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ExecutionError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ExecutionError::Panicked(message)
    }

    /// Check if this is a deferred declared failure.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Check if this is an undeclared (internal) failure.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Unexpected(_))
    }

    /// Check if a worker panicked.
    pub fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Check if the pool refused or dropped the work.
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    /// Borrow the deferred cause as the declared type, if it is one.
    pub fn deferred_cause<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Deferred(cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Take the deferred cause as the declared type, if it is one.
    pub fn into_deferred<E>(self) -> Option<E>
    where
        E: std::error::Error + 'static,
    {
        self.try_into_deferred().ok()
    }

    /// Like [`into_deferred`](Self::into_deferred), but hands `self` back when the cause is not
    /// an `E`.
    pub fn try_into_deferred<E>(self) -> Result<E, Self>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Deferred(cause) => cause.downcast::<E>().map(|e| *e).map_err(Self::Deferred),
            other => Err(other),
        }
    }
}

/// Failure returned by the eager `try_for_each_parallel`.
#[derive(Debug, thiserror::Error)]
pub enum StreamError<E> {
    /// A declared failure exhausted its retries; handed back as the caller's own type.
    #[error("{0}")]
    Declared(E),
    /// Anything else that stopped the execution.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl<E> StreamError<E> {
    /// Check if this is the caller's declared failure.
    pub fn is_declared(&self) -> bool {
        matches!(self, Self::Declared(_))
    }

    /// Check if this is an undeclared (internal) failure.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Unexpected(_)))
    }

    /// Get the declared failure if present.
    pub fn into_declared(self) -> Option<E> {
        match self {
            Self::Declared(e) => Some(e),
            Self::Execution(_) => None,
        }
    }

    /// Borrow the declared failure if present.
    pub fn as_declared(&self) -> Option<&E> {
        match self {
            Self::Declared(e) => Some(e),
            Self::Execution(_) => None,
        }
    }

    /// Borrow the execution error if present.
    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            Self::Declared(_) => None,
            Self::Execution(e) => Some(e),
        }
    }
}

/// Disposal of a stream failed.
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// The owned pool did not shut down cleanly.
    #[error("failed to shut down owned worker pool: {0}")]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("dummy: {0}")]
    struct DummyError(&'static str);

    #[test]
    fn declared_converts_with_question_mark() {
        fn inner() -> Result<(), DummyError> {
            Err(DummyError("x"))
        }
        fn op() -> Result<(), Failure<DummyError>> {
            inner()?;
            Ok(())
        }
        let err = op().unwrap_err();
        assert!(err.is_declared());
        assert_eq!(err.into_declared(), Some(DummyError("x")));
    }

    #[test]
    fn classify_splits_by_runtime_type() {
        let boxed: BoxError = Box::new(DummyError("declared"));
        let failure = Failure::<DummyError>::classify(boxed);
        assert!(matches!(failure, Failure::Declared(DummyError("declared"))));

        let boxed: BoxError = Box::new(io::Error::new(io::ErrorKind::Other, "other"));
        let failure = Failure::<DummyError>::classify(boxed);
        match failure {
            Failure::Undeclared(e) => assert_eq!(e.to_string(), "other"),
            Failure::Declared(_) => panic!("io error must not classify as declared"),
        }
    }

    #[test]
    fn undeclared_display_is_marked() {
        let failure = Failure::<DummyError>::undeclared("boom");
        assert!(!failure.is_declared());
        assert_eq!(failure.to_string(), "undeclared failure: boom");
    }

    #[test]
    fn deferred_keeps_declared_cause() {
        let err = ExecutionError::Deferred(Box::new(DummyError("late")));
        assert!(err.is_deferred());
        assert!(!err.is_unexpected());
        assert_eq!(err.deferred_cause::<DummyError>(), Some(&DummyError("late")));
        assert!(err.deferred_cause::<io::Error>().is_none());
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "dummy: late");
        assert_eq!(err.into_deferred::<DummyError>(), Some(DummyError("late")));
    }

    #[test]
    fn unexpected_is_distinct_from_deferred() {
        let err = ExecutionError::Unexpected("bad".into());
        assert!(err.is_unexpected());
        assert!(!err.is_deferred());
        assert!(err.into_deferred::<DummyError>().is_none());
    }

    #[test]
    fn try_into_deferred_hands_back_other_causes() {
        let err = ExecutionError::Deferred(Box::new(DummyError("io expected")));
        let err = err.try_into_deferred::<io::Error>().unwrap_err();
        assert_eq!(err.deferred_cause::<DummyError>(), Some(&DummyError("io expected")));

        let err = ExecutionError::Panicked("p".into());
        assert!(err.try_into_deferred::<DummyError>().unwrap_err().is_panicked());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = ExecutionError::from_panic(Box::new("static str"));
        assert!(matches!(err, ExecutionError::Panicked(ref m) if m == "static str"));
        let err = ExecutionError::from_panic(Box::new(String::from("owned")));
        assert!(matches!(err, ExecutionError::Panicked(ref m) if m == "owned"));
        let err = ExecutionError::from_panic(Box::new(42_u32));
        assert!(err.is_panicked());
    }

    #[test]
    fn stream_error_accessors() {
        let declared: StreamError<DummyError> = StreamError::Declared(DummyError("d"));
        assert!(declared.is_declared());
        assert_eq!(declared.as_declared(), Some(&DummyError("d")));
        assert!(declared.as_execution().is_none());
        assert_eq!(declared.to_string(), "dummy: d");

        let exec: StreamError<DummyError> = ExecutionError::Pool(PoolError::ShutDown).into();
        assert!(!exec.is_declared());
        assert!(exec.as_execution().map_or(false, ExecutionError::is_pool));
        assert_eq!(exec.to_string(), "worker pool is shut down");
        assert!(exec.into_declared().is_none());
    }

    #[test]
    fn pool_error_display() {
        let err = PoolError::ShutdownTimedOut { in_flight: 3 };
        let msg = err.to_string();
        assert!(msg.contains("grace period"));
        assert!(msg.contains('3'));
        assert_eq!(PoolError::InvalidWorkers(0).to_string(), "worker count must be > 0 (got 0)");
    }

    #[test]
    fn slot_error_wraps_source() {
        let err = SlotError::new("full");
        assert_eq!(err.to_string(), "failure slot rejected record: full");
        assert!(err.source().is_some());
    }
}
