//! Task execution shim.
//!
//! The scheduler hands units to a [`TaskQueue`]; the queue delivers them to
//! a [`UnitHandler`]. Two implementations share the contract:
//! - [`InlineQueue`]: runs units on the enqueueing thread, for tests and
//!   single-shot tools.
//! - [`TokioQueue`]: a pool of tokio workers draining an unbounded channel.
//!
//! Delivery is at-least-once with no ordering between units. Retryable
//! failures (storage hiccups) are redelivered up to `max_attempts`;
//! concurrent-modification conflicts never are.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::runner::UnitOutcome;
use crate::unit::PropagationUnit;

/// Fire-and-forget dispatch of propagation units.
pub trait TaskQueue: Send + Sync {
    /// Accepts `unit` for eventual execution. Errors only if the queue can
    /// no longer accept work; failures of the unit itself are never
    /// reported here.
    fn enqueue(&self, unit: PropagationUnit) -> Result<(), SyncError>;
}

/// Executes one unit.
pub trait UnitHandler: Send + Sync {
    fn handle(&self, unit: &PropagationUnit) -> Result<UnitOutcome, SyncError>;
}

/// A unit that failed for good.
#[derive(Debug)]
pub struct UnitFailure {
    pub unit: PropagationUnit,
    pub error: SyncError,
    pub attempts: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Inline
// ---------------------------------------------------------------------------

/// Runs units synchronously on the caller's thread.
///
/// Units enqueued while a drain is in progress (including by the handler
/// itself) are appended and processed by that drain, so cascades run
/// breadth-first without recursion. When `enqueue` returns on the outermost
/// call, every transitively scheduled unit has run.
pub struct InlineQueue {
    handler: OnceLock<Weak<dyn UnitHandler>>,
    pending: Mutex<VecDeque<PropagationUnit>>,
    draining: AtomicBool,
    failures: Mutex<Vec<UnitFailure>>,
    executed: AtomicUsize,
    max_attempts: u32,
}

impl InlineQueue {
    pub fn new(config: &EngineConfig) -> Self {
        InlineQueue {
            handler: OnceLock::new(),
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            failures: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Attaches the handler. Held weakly: the handler usually owns the
    /// scheduler that owns this queue.
    pub fn bind(&self, handler: Weak<dyn UnitHandler>) -> Result<(), SyncError> {
        self.handler
            .set(handler)
            .map_err(|_| SyncError::Execution("inline queue already bound".into()))
    }

    /// Units that failed permanently since the last call.
    pub fn take_failures(&self) -> Vec<UnitFailure> {
        std::mem::take(&mut *lock(&self.failures))
    }

    /// Number of units executed so far, successful or not.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    fn drain(&self) -> Result<(), SyncError> {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // An outer drain picks the unit up.
                return Ok(());
            }
            let result = self.drain_pending();
            self.draining.store(false, Ordering::Release);
            result?;
            if lock(&self.pending).is_empty() {
                return Ok(());
            }
        }
    }

    fn drain_pending(&self) -> Result<(), SyncError> {
        let handler = self
            .handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Execution("inline queue has no live handler".into()))?;
        loop {
            let Some(unit) = lock(&self.pending).pop_front() else {
                return Ok(());
            };
            self.run(handler.as_ref(), unit);
        }
    }

    fn run(&self, handler: &dyn UnitHandler, unit: PropagationUnit) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.executed.fetch_add(1, Ordering::SeqCst);
            match handler.handle(&unit) {
                Ok(outcome) => {
                    debug!(unit = %unit, ?outcome, "unit done");
                    return;
                }
                Err(error) if error.is_retryable() && attempts < self.max_attempts => {
                    debug!(unit = %unit, attempts, error = %error, "retrying unit");
                }
                Err(error) => {
                    warn!(unit = %unit, attempts, error = %error, "unit failed");
                    lock(&self.failures).push(UnitFailure {
                        unit,
                        error,
                        attempts,
                    });
                    return;
                }
            }
        }
    }
}

impl TaskQueue for InlineQueue {
    fn enqueue(&self, unit: PropagationUnit) -> Result<(), SyncError> {
        lock(&self.pending).push_back(unit);
        self.drain()
    }
}

// ---------------------------------------------------------------------------
// Tokio
// ---------------------------------------------------------------------------

/// Queued executor: `workers` tokio tasks share one unbounded channel, and
/// each unit runs on the blocking pool (handlers do synchronous storage
/// I/O).
pub struct TokioQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<PropagationUnit>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PropagationUnit>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    failures: Arc<Mutex<Vec<UnitFailure>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: EngineConfig,
}

impl TokioQueue {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        TokioQueue {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Spawns the worker tasks on the current tokio runtime. Units enqueued
    /// before `start` are buffered and run once workers exist.
    pub fn start(&self, handler: Arc<dyn UnitHandler>) -> Result<(), SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Execution(format!("no tokio runtime: {e}")))?;
        let receiver = lock(&self.receiver)
            .take()
            .ok_or_else(|| SyncError::Execution("queue already started".into()))?;
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = lock(&self.workers);
        for worker in 0..self.config.workers.max(1) {
            let ctx = WorkerContext {
                worker,
                receiver: Arc::clone(&receiver),
                handler: Arc::clone(&handler),
                pending: Arc::clone(&self.pending),
                idle: Arc::clone(&self.idle),
                failures: Arc::clone(&self.failures),
                config: self.config.clone(),
            };
            workers.push(runtime.spawn(ctx.run()));
        }
        Ok(())
    }

    /// Units accepted but not yet finished (including retries).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once no unit is pending. Cascades count: a unit enqueued by
    /// a running unit is pending before its parent finishes.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn take_failures(&self) -> Vec<UnitFailure> {
        std::mem::take(&mut *lock(&self.failures))
    }

    /// Closes the channel and waits for workers to drain what was already
    /// accepted. Later enqueues fail.
    pub async fn shutdown(&self) {
        drop(lock(&self.sender).take());
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "queue worker ended abnormally");
            }
        }
    }
}

impl TaskQueue for TokioQueue {
    fn enqueue(&self, unit: PropagationUnit) -> Result<(), SyncError> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(SyncError::Execution("queue is shut down".into()));
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(unit).is_err() {
            finish(&self.pending, &self.idle);
            return Err(SyncError::Execution("queue workers are gone".into()));
        }
        Ok(())
    }
}

fn finish(pending: &AtomicUsize, idle: &Notify) {
    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

struct WorkerContext {
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PropagationUnit>>>,
    handler: Arc<dyn UnitHandler>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    failures: Arc<Mutex<Vec<UnitFailure>>>,
    config: EngineConfig,
}

impl WorkerContext {
    async fn run(self) {
        debug!(worker = self.worker, "queue worker started");
        loop {
            let next = self.receiver.lock().await.recv().await;
            let Some(unit) = next else {
                break;
            };
            self.deliver(unit).await;
            finish(&self.pending, &self.idle);
        }
        debug!(worker = self.worker, "queue worker stopped");
    }

    async fn deliver(&self, unit: PropagationUnit) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let handler = Arc::clone(&self.handler);
            let job = unit.clone();
            let result = tokio::task::spawn_blocking(move || handler.handle(&job))
                .await
                .unwrap_or_else(|e| Err(SyncError::Execution(format!("unit task panicked: {e}"))));
            match result {
                Ok(outcome) => {
                    debug!(worker = self.worker, unit = %unit, ?outcome, "unit done");
                    return;
                }
                Err(error) if error.is_retryable() && attempts < max_attempts => {
                    debug!(worker = self.worker, unit = %unit, attempts, error = %error, "retrying unit");
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(error) => {
                    warn!(worker = self.worker, unit = %unit, attempts, error = %error, "unit failed");
                    lock(&self.failures).push(UnitFailure {
                        unit,
                        error,
                        attempts,
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosync_core::id::FeatureId;
    use geosync_storage::StorageError;

    use crate::unit::{PropertySelection, Reason};

    fn unit(n: i64) -> PropagationUnit {
        PropagationUnit::recompute(FeatureId(n), Reason::SelfChanged, PropertySelection::All)
    }

    /// Records deliveries; unit `n` enqueues unit `n - 1` down to zero.
    struct Countdown {
        queue: Arc<InlineQueue>,
        seen: Mutex<Vec<i64>>,
    }

    impl UnitHandler for Countdown {
        fn handle(&self, delivered: &PropagationUnit) -> Result<UnitOutcome, SyncError> {
            let n = delivered.target_feature().map(|f| f.0).unwrap_or_default();
            self.seen.lock().unwrap().push(n);
            if n > 0 {
                self.queue.enqueue(unit(n - 1))?;
            }
            Ok(UnitOutcome::FannedOut(usize::from(n > 0)))
        }
    }

    #[test]
    fn inline_nested_enqueue_runs_without_recursion() {
        let queue = Arc::new(InlineQueue::new(&EngineConfig::default()));
        let handler = Arc::new(Countdown {
            queue: Arc::clone(&queue),
            seen: Mutex::new(Vec::new()),
        });
        let dyn_handler: Arc<dyn UnitHandler> = handler.clone();
        queue.bind(Arc::downgrade(&dyn_handler)).unwrap();

        queue.enqueue(unit(3)).unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), vec![3, 2, 1, 0]);
        assert_eq!(queue.executed(), 4);
        assert!(queue.take_failures().is_empty());
    }

    struct Flaky {
        calls: AtomicUsize,
        error: fn() -> SyncError,
    }

    impl UnitHandler for Flaky {
        fn handle(&self, _unit: &PropagationUnit) -> Result<UnitOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    #[test]
    fn inline_retries_storage_errors_but_not_conflicts() {
        let config = EngineConfig {
            max_attempts: 3,
            ..EngineConfig::default()
        };
        for (error, expected_calls) in [
            ((|| SyncError::Storage(StorageError::LockPoisoned)) as fn() -> SyncError, 3),
            (
                (|| SyncError::ConcurrentPropertyModification {
                    feature: FeatureId(1),
                    keys: vec!["length".into()],
                }) as fn() -> SyncError,
                1,
            ),
        ] {
            let queue = InlineQueue::new(&config);
            let handler: Arc<dyn UnitHandler> = Arc::new(Flaky {
                calls: AtomicUsize::new(0),
                error,
            });
            queue.bind(Arc::downgrade(&handler)).unwrap();
            queue.enqueue(unit(1)).unwrap();
            let failures = queue.take_failures();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].attempts, expected_calls);
            assert_eq!(queue.executed(), expected_calls as usize);
        }
    }

    #[test]
    fn unbound_inline_queue_errors() {
        let queue = InlineQueue::new(&EngineConfig::default());
        assert!(matches!(queue.enqueue(unit(1)), Err(SyncError::Execution(_))));
    }

    struct Counter(AtomicUsize);

    impl UnitHandler for Counter {
        fn handle(&self, _unit: &PropagationUnit) -> Result<UnitOutcome, SyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(UnitOutcome::FannedOut(0))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_queue_runs_everything_before_idle() {
        let queue = TokioQueue::new(EngineConfig {
            workers: 3,
            ..EngineConfig::default()
        });
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        for n in 0..20 {
            queue.enqueue(unit(n)).unwrap();
        }
        queue.start(counter.clone()).unwrap();
        queue.wait_idle().await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 20);
        assert_eq!(queue.pending(), 0);

        queue.shutdown().await;
        assert!(queue.enqueue(unit(99)).is_err());
    }

    #[tokio::test]
    async fn tokio_queue_records_final_failures() {
        let queue = TokioQueue::new(EngineConfig {
            workers: 1,
            max_attempts: 2,
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        });
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            error: || SyncError::Storage(StorageError::LockPoisoned),
        });
        queue.start(flaky.clone()).unwrap();
        queue.enqueue(unit(1)).unwrap();
        queue.wait_idle().await;
        let failures = queue.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 2);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        queue.shutdown().await;
    }
}
