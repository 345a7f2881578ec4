//! Thread-pool bulkhead for non-blocking submission
//!
//! Work is pushed onto a bounded queue drained by a worker pool. When the
//! pool is busy and the queue is full, submission fails immediately with a
//! `BulkheadFull` condition; the submitting thread is never blocked. The
//! outcome of accepted work travels through a [`TaskHandle`]; a failure
//! inside the task is the handle's result, never a submission error.
//!
//! Core workers live for the pool's lifetime. When the queue backs up, surge
//! workers are added up to `max_pool_size` and retire after `keep_alive` of
//! idleness. The pool's lifecycle is caller-owned: `shutdown` (or drop)
//! closes the queue, drains accepted work, and joins the workers.

use crate::bulkhead::{BulkheadEvent, BulkheadEventKind};
use crate::errors::GuardError;
use crate::events::EventBus;
use crate::registry::NamedGuard;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Thread-pool bulkhead configuration.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolBulkheadConfig {
    /// Workers kept alive for the pool's lifetime.
    pub core_pool_size: usize,
    /// Upper bound on workers, surge included.
    pub max_pool_size: usize,
    /// Submitted-but-not-started work the queue will hold.
    pub queue_capacity: usize,
    /// Idle time after which a surge worker retires.
    pub keep_alive: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 2,
            max_pool_size: 4,
            queue_capacity: 100,
            keep_alive: Duration::from_secs(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    /// Set the number of always-alive workers.
    pub fn with_core_pool_size(mut self, size: usize) -> Self {
        self.core_pool_size = size;
        self
    }

    /// Set the worker ceiling.
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the queue bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the surge-worker idle retirement time.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Advisory cancellation flag shared between a caller and its task.
///
/// Cancelling sets the flag; work that wants to stop early polls it. Nothing
/// forcibly interrupts a task that ignores the signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) enum TaskOutcome<T, E> {
    Completed(Result<T, E>),
    Panicked(Box<dyn Any + Send>),
}

/// Completion handle for work accepted by a [`ThreadPoolBulkhead`].
pub struct TaskHandle<T, E> {
    name: String,
    cancel: CancelToken,
    receiver: flume::Receiver<TaskOutcome<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// The cancellation token wired into the task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Signal best-effort cancellation to the task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish and return its outcome. A panic inside
    /// the task resumes on the joining thread, like `std::thread::join`.
    pub fn join(self) -> Result<T, GuardError<E>> {
        let outcome = self
            .receiver
            .recv()
            .unwrap_or_else(|_| panic!("task '{}' dropped without an outcome", self.name));
        resolve(outcome)
    }

    /// Wait up to `timeout` for the task. On expiry the task keeps running
    /// and a `Timeout` condition is returned.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, GuardError<E>> {
        match self.recv_within(timeout) {
            Some(outcome) => resolve(outcome),
            None => Err(GuardError::Timeout {
                name: self.name.clone(),
                timeout,
            }),
        }
    }

    pub(crate) fn recv_within(&self, timeout: Duration) -> Option<TaskOutcome<T, E>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub(crate) fn entity_name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn resolve<T, E>(outcome: TaskOutcome<T, E>) -> Result<T, GuardError<E>> {
    match outcome {
        TaskOutcome::Completed(Ok(value)) => Ok(value),
        TaskOutcome::Completed(Err(error)) => Err(GuardError::Execution(error)),
        TaskOutcome::Panicked(payload) => panic::resume_unwind(payload),
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue-and-pool admission gate.
pub struct ThreadPoolBulkhead {
    name: String,
    config: ThreadPoolBulkheadConfig,
    sender: Mutex<Option<flume::Sender<Job>>>,
    receiver: flume::Receiver<Job>,
    live_workers: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventBus<BulkheadEvent>>,
}

impl ThreadPoolBulkhead {
    /// Create the pool and start its core workers.
    ///
    /// # Panics
    ///
    /// Panics if `core_pool_size` is 0, `max_pool_size < core_pool_size`,
    /// or `queue_capacity` is 0.
    pub fn new(name: impl Into<String>, config: ThreadPoolBulkheadConfig) -> Self {
        assert!(
            config.core_pool_size > 0,
            "ThreadPoolBulkhead needs at least one core worker"
        );
        assert!(
            config.max_pool_size >= config.core_pool_size,
            "ThreadPoolBulkhead max pool size must cover the core pool"
        );
        assert!(
            config.queue_capacity > 0,
            "ThreadPoolBulkhead queue capacity must be greater than 0"
        );

        let name = name.into();
        let (sender, receiver) = flume::bounded::<Job>(config.queue_capacity);
        let live_workers = Arc::new(AtomicUsize::new(config.core_pool_size));

        let mut workers = Vec::with_capacity(config.core_pool_size);
        for index in 0..config.core_pool_size {
            let queue = receiver.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{name}-worker-{index}"))
                    .spawn(move || {
                        // Core workers drain until the queue is closed and empty.
                        while let Ok(job) = queue.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn bulkhead worker thread"),
            );
        }

        Self {
            name,
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            live_workers,
            workers: Mutex::new(workers),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.config
    }

    /// Event bus for this pool.
    pub fn events(&self) -> &EventBus<BulkheadEvent> {
        &self.events
    }

    /// Jobs accepted but not yet started.
    pub fn queue_depth(&self) -> usize {
        self.receiver.len()
    }

    /// Submit work without wiring a cancellation signal into it.
    pub fn submit<T, E>(
        &self,
        task: impl FnOnce() -> Result<T, E> + Send + 'static,
    ) -> Result<TaskHandle<T, E>, GuardError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with(move |_cancel| task())
    }

    /// Submit work that receives the handle's [`CancelToken`] so it can stop
    /// early when asked to.
    pub fn submit_with<T, E>(
        &self,
        task: impl FnOnce(CancelToken) -> Result<T, E> + Send + 'static,
    ) -> Result<TaskHandle<T, E>, GuardError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let cancel = CancelToken::new();
        let task_cancel = cancel.clone();
        let (result_tx, result_rx) = flume::bounded::<TaskOutcome<T, E>>(1);
        let pool_name = self.name.clone();
        let handle_name = self.name.clone();
        let completion_events = Arc::clone(&self.events);

        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || task(task_cancel)));
            let outcome = match outcome {
                Ok(result) => TaskOutcome::Completed(result),
                Err(payload) => {
                    tracing::warn!(pool = %pool_name, "bulkhead task panicked");
                    TaskOutcome::Panicked(payload)
                }
            };
            // Publish before delivering, so an observer is never behind a
            // caller that already resumed. The caller may also have dropped
            // the handle; an undeliverable outcome is fine.
            completion_events.publish(BulkheadEvent::new(
                &pool_name,
                BulkheadEventKind::CallFinished,
            ));
            let _ = result_tx.send(outcome);
        });

        let accepted = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => sender.try_send(job).is_ok(),
                None => false,
            }
        };

        if !accepted {
            self.events.publish(BulkheadEvent::new(
                &self.name,
                BulkheadEventKind::CallRejected,
            ));
            return Err(GuardError::BulkheadFull {
                name: self.name.clone(),
                limit: self.config.queue_capacity,
            });
        }

        self.events.publish(BulkheadEvent::new(
            &self.name,
            BulkheadEventKind::CallPermitted,
        ));
        self.maybe_add_surge_worker();

        Ok(TaskHandle {
            name: handle_name,
            cancel,
            receiver: result_rx,
        })
    }

    /// Close the queue, let workers drain accepted work, and join them.
    /// Subsequent submissions are rejected. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            // A worker that panicked through a job already delivered the
            // panic to the task handle; nothing to do with it here.
            let _ = worker.join();
        }
    }

    /// Spawn a surge worker when the queue is backing up and the pool has
    /// headroom. Surge workers retire after `keep_alive` idle time.
    fn maybe_add_surge_worker(&self) {
        if self.receiver.is_empty() {
            return;
        }
        let mut live = self.live_workers.load(Ordering::Acquire);
        loop {
            if live >= self.config.max_pool_size {
                return;
            }
            match self.live_workers.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }

        let queue = self.receiver.clone();
        let keep_alive = self.config.keep_alive;
        let live_workers = Arc::clone(&self.live_workers);
        let spawned = thread::Builder::new()
            .name(format!("{}-surge", self.name))
            .spawn(move || {
                while let Ok(job) = queue.recv_timeout(keep_alive) {
                    job();
                }
                live_workers.fetch_sub(1, Ordering::AcqRel);
            });
        match spawned {
            Ok(worker) => self.workers.lock().push(worker),
            Err(_) => {
                // Could not add capacity; the core workers still drain the queue.
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl NamedGuard for ThreadPoolBulkhead {
    type Config = ThreadPoolBulkheadConfig;

    fn with_config(name: &str, config: ThreadPoolBulkheadConfig) -> Self {
        Self::new(name, config)
    }
}

impl Drop for ThreadPoolBulkhead {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}
