//! Ordered fan-out/join over a worker pool
//!
//! Every item becomes one unit on the pool. Handles are kept in a bounded FIFO window and joined
//! strictly front-first, so results come back in input order whatever the completion order.
//!
//! Soft cancellation: once a unit's failure is recorded (`StageUnit::halted`), no further item
//! is pulled from the source. Units already dispatched run to completion; those that had not
//! started yet see the recorded failure and skip themselves. Faults (undeclared failures,
//! panics, pool refusal) abort the window the same way, and so does a lazy stage that gives up
//! on its pending units.

use crate::error::{BoxError, ExecutionError, Failure, PoolError};
use crate::pool::WorkerPool;
use crate::retry::{Outcome, RetryExecutor};
use crate::slot::FailureSlot;
use futures::executor::block_on;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::task::JoinHandle;

/// Boxed upstream sequence; errors from earlier stages travel in-band.
pub(crate) type Source<T> = Box<dyn Iterator<Item = Result<T, ExecutionError>>>;

type UnitResult<R> = Result<Outcome<R>, ExecutionError>;

/// What one stage does with one item on a worker.
pub(crate) trait StageUnit<T>: Send + Sync + 'static {
    type Output: Send + 'static;

    fn run(&self, item: T) -> UnitResult<Self::Output>;

    /// Whether dispatching should stop because a failure was recorded.
    fn halted(&self) -> bool {
        false
    }

    /// Take the recorded failure out, boxed, for deferred surfacing.
    fn deferred(&self) -> Option<BoxError> {
        None
    }
}

/// Plain mapping; panics are the only way it fails.
pub(crate) struct Infallible<F, R> {
    map: F,
    _output: PhantomData<fn() -> R>,
}

impl<F, R> Infallible<F, R> {
    pub(crate) fn new(map: F) -> Self {
        Self { map, _output: PhantomData }
    }
}

impl<T, R, F> StageUnit<T> for Infallible<F, R>
where
    F: Fn(T) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn run(&self, item: T) -> UnitResult<R> {
        Ok(Outcome::Produced((self.map)(item)))
    }
}

/// Fallible operation behind a [`RetryExecutor`] sharing one slot across all units.
pub(crate) struct Retrying<F, E, S, R> {
    executor: RetryExecutor<E, S>,
    operation: F,
    _output: PhantomData<fn() -> R>,
}

impl<F, E, S, R> Retrying<F, E, S, R> {
    pub(crate) fn new(executor: RetryExecutor<E, S>, operation: F) -> Self {
        Self { executor, operation, _output: PhantomData }
    }
}

impl<T, R, E, S, F> StageUnit<T> for Retrying<F, E, S, R>
where
    F: Fn(&T) -> Result<R, Failure<E>> + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
    S: FailureSlot<E> + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn run(&self, item: T) -> UnitResult<R> {
        self.executor.execute(&item, &self.operation)
    }

    fn halted(&self) -> bool {
        self.executor.slot().is_set()
    }

    fn deferred(&self) -> Option<BoxError> {
        self.executor.slot().take().map(|failure| Box::new(failure) as BoxError)
    }
}

/// Marks the window aborted when a unit unwinds.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Bounded FIFO of dispatched units.
///
/// Units share an abort flag with the window. A unit that fails with a fault (anything other
/// than a recorded declared failure) or panics raises it, and so does the window when it gives
/// up on its pending units. Units that have not started yet see the flag and skip themselves.
struct JoinWindow<R> {
    pool: WorkerPool,
    capacity: usize,
    pending: VecDeque<JoinHandle<UnitResult<R>>>,
    aborted: Arc<AtomicBool>,
}

impl<R: Send + 'static> JoinWindow<R> {
    fn new(pool: WorkerPool, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pool,
            capacity,
            pending: VecDeque::with_capacity(capacity),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn dispatch<T, U>(&mut self, unit: &Arc<U>, item: T) -> Result<(), PoolError>
    where
        T: Send + 'static,
        U: StageUnit<T, Output = R>,
    {
        let unit = Arc::clone(unit);
        let aborted = Arc::clone(&self.aborted);
        let handle = self.pool.spawn(move || {
            if aborted.load(Ordering::Acquire) {
                tracing::trace!("execution aborted; skipping item");
                return Ok(Outcome::Absent);
            }
            let _guard = AbortOnPanic(&aborted);
            let result = unit.run(item);
            if result.is_err() {
                aborted.store(true, Ordering::Release);
            }
            result
        })?;
        self.pending.push_back(handle);
        Ok(())
    }

    /// Block on the oldest unit. `None` once nothing is pending.
    fn join_next(&mut self) -> Option<UnitResult<R>> {
        let handle = self.pending.pop_front()?;
        Some(match block_on(handle) {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(ExecutionError::from_panic(err.into_panic())),
            Err(_) => Err(ExecutionError::Pool(PoolError::ShutDown)),
        })
    }

    /// Stop pending units from starting and let running ones finish without waiting for them.
    fn detach(&mut self) {
        self.abort();
        self.pending.clear();
    }
}

/// Lazy dispatch-and-join stage; one per `map_joining` call.
pub(crate) struct JoinStage<T, U: StageUnit<T>> {
    source: Option<Source<T>>,
    unit: Arc<U>,
    window: JoinWindow<U::Output>,
    held: Option<ExecutionError>,
    done: bool,
}

impl<T, U> JoinStage<T, U>
where
    T: Send + 'static,
    U: StageUnit<T>,
{
    pub(crate) fn new(source: Source<T>, unit: U, pool: WorkerPool, window: usize) -> Self {
        Self {
            source: Some(source),
            unit: Arc::new(unit),
            window: JoinWindow::new(pool, window),
            held: None,
            done: false,
        }
    }

    fn refill(&mut self) {
        while self.held.is_none()
            && !self.window.is_full()
            && !self.window.is_aborted()
            && !self.unit.halted()
        {
            let Some(next) = self.source.as_mut().and_then(|source| source.next()) else {
                self.source = None;
                break;
            };
            match next {
                Ok(item) => {
                    if let Err(err) = self.window.dispatch(&self.unit, item) {
                        self.held = Some(err.into());
                    }
                }
                Err(err) => self.held = Some(err),
            }
        }
        if self.held.is_some() {
            self.source = None;
        }
    }

    fn finish(&mut self, err: ExecutionError) -> ExecutionError {
        self.done = true;
        self.source = None;
        self.window.detach();
        err
    }
}

impl<T, U> Iterator for JoinStage<T, U>
where
    T: Send + 'static,
    U: StageUnit<T>,
{
    type Item = Result<U::Output, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.refill();
            match self.window.join_next() {
                Some(Ok(Outcome::Produced(value))) => return Some(Ok(value)),
                Some(Ok(Outcome::Absent)) => {
                    if let Some(cause) = self.unit.deferred() {
                        return Some(Err(self.finish(ExecutionError::Deferred(cause))));
                    }
                }
                Some(Err(err)) => return Some(Err(self.finish(err))),
                None => {
                    self.done = true;
                    if let Some(cause) = self.unit.deferred() {
                        return Some(Err(ExecutionError::Deferred(cause)));
                    }
                    return self.held.take().map(Err);
                }
            }
        }
    }
}

/// Eagerly run `unit` over every item and wait for all dispatched units.
///
/// The first fault (undeclared failure, panic, pool refusal, upstream error) stops dispatching
/// and is returned once every dispatched unit has been joined. Declared failures stay in the
/// unit's slot for the caller to inspect.
pub(crate) fn drive<T, U>(
    source: Source<T>,
    unit: U,
    pool: &WorkerPool,
    window: usize,
) -> Result<(), ExecutionError>
where
    T: Send + 'static,
    U: StageUnit<T>,
{
    let unit = Arc::new(unit);
    let mut window = JoinWindow::new(pool.clone(), window);
    let mut source = Some(source);
    let mut fault: Option<ExecutionError> = None;

    loop {
        while fault.is_none() && !window.is_full() && !window.is_aborted() && !unit.halted() {
            let Some(next) = source.as_mut().and_then(|source| source.next()) else {
                source = None;
                break;
            };
            match next {
                Ok(item) => {
                    if let Err(err) = window.dispatch(&unit, item) {
                        window.abort();
                        fault = Some(err.into());
                    }
                }
                Err(err) => {
                    window.abort();
                    fault = Some(err);
                }
            }
        }
        match window.join_next() {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                window.abort();
                if fault.is_none() {
                    tracing::debug!(error = %err, "unit failed; no further items will be dispatched");
                    fault = Some(err);
                }
            }
            None => break,
        }
    }

    match fault {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::ErrorSlot;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("TestError: {0}")]
    struct TestError(u32);

    fn source<T, I>(items: I) -> Source<T>
    where
        T: 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Box::new(items.into_iter().map(Ok))
    }

    fn retrying<F, R>(
        retries: usize,
        operation: F,
    ) -> (Retrying<F, TestError, ErrorSlot<TestError>, R>, Arc<ErrorSlot<TestError>>)
    where
        F: Fn(&u32) -> Result<R, Failure<TestError>> + Send + Sync + 'static,
        R: Send + 'static,
    {
        let slot = Arc::new(ErrorSlot::new());
        (Retrying::new(RetryExecutor::new(retries, slot.clone()), operation), slot)
    }

    #[test]
    fn stage_preserves_input_order() {
        let pool = WorkerPool::new(4).unwrap();
        // later items finish first
        let unit = Infallible::new(|i: u64| {
            thread::sleep(Duration::from_millis(40 - i * 4));
            i
        });
        let stage = JoinStage::new(source(0..10_u64), unit, pool, 8);
        let out: Vec<u64> = stage.map(Result::unwrap).collect();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn stage_is_lazy() {
        let pool = WorkerPool::new(2).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let unit = Infallible::new(move |i: u32| {
            counted.fetch_add(1, Ordering::SeqCst);
            i
        });
        let mut stage = JoinStage::new(source(0..100_u32), unit, pool, 4);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "nothing runs before consumption");

        assert_eq!(stage.next().unwrap().unwrap(), 0);
        thread::sleep(Duration::from_millis(20));
        assert!(calls.load(Ordering::SeqCst) <= 4, "dispatch stays within the window");
    }

    #[test]
    fn stage_surfaces_deferred_failure_and_fuses() {
        let pool = WorkerPool::new(2).unwrap();
        let (unit, _slot) = retrying(0, |i: &u32| {
            if *i == 3 {
                Err(Failure::Declared(TestError(*i)))
            } else {
                Ok(*i)
            }
        });
        let mut stage = JoinStage::new(source(0..10_u32), unit, pool, 1);
        let mut values = Vec::new();
        let err = loop {
            match stage.next().expect("stage ends with an error") {
                Ok(v) => values.push(v),
                Err(err) => break err,
            }
        };
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(err.deferred_cause::<TestError>(), Some(&TestError(3)));
        assert!(stage.next().is_none(), "stage is fused after a failure");
    }

    #[test]
    fn stage_passes_upstream_errors_through() {
        let pool = WorkerPool::new(2).unwrap();
        let upstream: Source<u32> = Box::new(
            vec![Ok(1), Ok(2), Err(ExecutionError::Panicked("upstream".into())), Ok(4)].into_iter(),
        );
        let stage = JoinStage::new(upstream, Infallible::new(|i: u32| i * 10), pool, 4);
        let out: Vec<_> = stage.collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().unwrap(), &10);
        assert_eq!(out[1].as_ref().unwrap(), &20);
        assert!(matches!(out[2], Err(ExecutionError::Panicked(ref m)) if m == "upstream"));
    }

    #[test]
    fn stage_reports_panics() {
        let pool = WorkerPool::new(2).unwrap();
        let unit = Infallible::new(|i: u32| {
            if i == 1 {
                panic!("bad item");
            }
            i
        });
        let out: Vec<_> = JoinStage::new(source(0..4_u32), unit, pool, 4).collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(ExecutionError::Panicked(ref m)) if m == "bad item"));
    }

    #[test]
    fn stage_on_shut_down_pool_reports_pool_error() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown(Duration::from_millis(50)).unwrap();
        let out: Vec<_> = JoinStage::new(source(0..3_u32), Infallible::new(|i: u32| i), pool, 2)
            .collect();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ExecutionError::Pool(PoolError::ShutDown))));
    }

    #[test]
    fn drive_runs_every_item() {
        let pool = WorkerPool::new(3).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = seen.clone();
        let (unit, slot) = retrying(0, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drive(source(0..50_u32), unit, &pool, 6).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 50);
        assert!(!slot.is_set());
    }

    #[test]
    fn drive_leaves_declared_failure_in_slot() {
        let pool = WorkerPool::new(2).unwrap();
        let (unit, slot) = retrying(0, |i: &u32| {
            if *i == 0 {
                Err(Failure::Declared(TestError(0)))
            } else {
                Ok(())
            }
        });
        drive(source(0..10_u32), unit, &pool, 4).unwrap();
        assert_eq!(slot.take(), Some(TestError(0)));
    }

    #[test]
    fn drive_stops_dispatching_after_failure() {
        let pool = WorkerPool::new(1).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let (unit, slot) = retrying(0, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Failure::Declared(TestError(0)))
        });
        drive(source(0..1000_u32), unit, &pool, 2).unwrap();
        assert!(slot.is_set());
        assert!(calls.load(Ordering::SeqCst) <= 2, "at most one window of units may start");
    }

    #[test]
    fn drive_returns_undeclared_failure_after_joining() {
        let pool = WorkerPool::new(2).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());
        let (unit, _slot) = retrying(3, move |i: &u32| {
            if *i == 0 {
                return Err(Failure::undeclared("corrupt"));
            }
            s.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let err = drive(source(0..4_u32), unit, &pool, 4).unwrap_err();
        assert!(err.is_unexpected());
        // every unit that started alongside the failing one still completed
        assert_eq!(started.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
    }

    fn slow_fault_then_count(
        started: &Arc<AtomicUsize>,
        panics: bool,
    ) -> impl Fn(&u32) -> Result<(), Failure<TestError>> + Send + Sync + 'static {
        let started = Arc::clone(started);
        move |i: &u32| {
            if *i == 0 {
                thread::sleep(Duration::from_millis(50));
                if panics {
                    panic!("unit blew up");
                }
                return Err(Failure::undeclared("corrupt"));
            }
            started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn drive_skips_queued_units_after_undeclared_failure() {
        let pool = WorkerPool::new(1).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let (unit, _slot) = retrying(0, slow_fault_then_count(&started, false));
        let err = drive(source(0..8_u32), unit, &pool, 8).unwrap_err();
        assert!(err.is_unexpected());
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drive_skips_queued_units_after_panic() {
        let pool = WorkerPool::new(1).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let (unit, _slot) = retrying(0, slow_fault_then_count(&started, true));
        let err = drive(source(0..8_u32), unit, &pool, 8).unwrap_err();
        assert!(matches!(err, ExecutionError::Panicked(_)));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stage_skips_queued_units_after_undeclared_failure() {
        let pool = WorkerPool::new(1).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let (unit, _slot) = retrying(0, slow_fault_then_count(&started, false));
        let mut stage = JoinStage::new(source(0..8_u32), unit, pool, 8);

        assert!(stage.next().unwrap().unwrap_err().is_unexpected());
        assert!(stage.next().is_none());
        // the detached units run after the consumer saw the failure; none may start the operation
        thread::sleep(Duration::from_millis(100));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }
}
