//! Request and callback execution
//!
//! Protocol calls block, so each session runs them on a small pool of request
//! worker threads fed by a crossbeam channel. Completions are delivered on a
//! separate single callback thread, in the order they were posted, so callers
//! never run on (or stall) a request worker.
//!
//! Cancellation is cooperative. A [`CancelToken`] is checked before a queued
//! item starts and by long-running items at their own safe points.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

/// Unit of work run on a queue thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Cancellation
// =============================================================================

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Caller's handle on a submitted operation
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: u64,
    token: CancelToken,
}

impl RequestHandle {
    /// Handle with a process-unique id
    pub fn new() -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            token: CancelToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request cancellation
    ///
    /// A queued operation will not run and completes with `Cancelled`; a
    /// running one finishes its current protocol call, then completes with
    /// `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Default for RequestHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of in-flight operations that can be cancelled together
///
/// Optionally bounded; inserting past the bound is refused.
#[derive(Debug, Default)]
pub struct OperationSet {
    operations: Mutex<HashMap<u64, CancelToken>>,
    capacity: Option<usize>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set refusing more than `capacity` concurrent entries
    pub fn bounded(capacity: usize) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, CancelToken>> {
        self.operations
            .lock()
            .expect("operation set lock poisoned")
    }

    /// Track an operation; returns false if the set is full
    pub fn insert(&self, handle: &RequestHandle) -> bool {
        let mut operations = self.lock();
        if self.capacity.is_some_and(|cap| operations.len() >= cap) {
            return false;
        }
        operations.insert(handle.id(), handle.token().clone());
        true
    }

    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Cancel every tracked operation and forget them; returns how many
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<CancelToken> = self.lock().drain().map(|(_, t)| t).collect();
        for token in &drained {
            token.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Threads draining one shared channel
///
/// A panicking job is logged and the worker carries on with the next one.
struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(name: &'static str, threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..threads.max(1))
            .filter_map(|n| {
                let receiver: Receiver<Job> = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{n}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                                warn!(
                                    pool = name,
                                    panic = %panic_message(payload.as_ref()),
                                    "queued job panicked"
                                );
                            }
                        }
                    })
                    .map_err(|e| warn!(pool = name, error = %e, "failed to spawn worker"))
                    .ok()
            })
            .collect();
        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job; hands it back if the pool is shut down
    fn submit(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock().expect("worker pool lock poisoned");
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Stop accepting jobs; queued jobs still run
    fn close(&self) {
        if self
            .sender
            .lock()
            .expect("worker pool lock poisoned")
            .take()
            .is_some()
        {
            debug!(pool = self.name, "queue closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .expect("worker pool lock poisoned")
            .is_none()
    }

    /// Close and wait for the workers to drain
    ///
    /// A worker cannot join itself, so when called from one of the pool's own
    /// threads that thread is left to exit on its own.
    fn join(&self) {
        self.close();
        let current = thread::current().id();
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("worker pool lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

/// Pool of threads that run protocol work
pub struct RequestQueue {
    pool: WorkerPool,
}

impl RequestQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            pool: WorkerPool::new("sharelink-request", concurrency),
        }
    }

    /// Queue a job; hands it back if the queue is shut down
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.pool.submit(job)
    }

    /// Stop accepting work; already queued jobs still run
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close and wait for queued work to finish
    pub fn shutdown(&self) {
        self.pool.join();
    }
}

/// Single thread delivering completions in FIFO order
pub struct CallbackQueue {
    pool: WorkerPool,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self {
            pool: WorkerPool::new("sharelink-callback", 1),
        }
    }

    /// Post a callback
    ///
    /// If the queue is already shut down the callback runs on the calling
    /// thread, so a completion is never lost.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        if let Err(callback) = self.pool.submit(Box::new(callback)) {
            callback();
        }
    }

    /// Post a callback, handing it back if the queue is shut down
    pub fn try_post(&self, callback: Job) -> Result<(), Job> {
        self.pool.submit(callback)
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Close and wait for posted callbacks to run
    pub fn shutdown(&self) {
        self.pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_request_handle_ids_are_unique() {
        let a = RequestHandle::new();
        let b = RequestHandle::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let handle = RequestHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.token().is_cancelled());
    }

    #[test]
    fn test_operation_set_cancel_all() {
        let set = OperationSet::new();
        let a = RequestHandle::new();
        let b = RequestHandle::new();
        set.insert(&a);
        set.insert(&b);
        set.remove(b.id());
        assert_eq!(set.cancel_all(), 1);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(set.is_empty());
    }

    #[test]
    fn test_bounded_operation_set() {
        let set = OperationSet::bounded(2);
        assert!(set.insert(&RequestHandle::new()));
        assert!(set.insert(&RequestHandle::new()));
        assert!(!set.insert(&RequestHandle::new()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_single_worker_runs_in_order() {
        let queue = RequestQueue::new(1);
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            queue
                .submit(Box::new(move || tx.send(i).unwrap()))
                .unwrap_or_else(|_| panic!("queue closed"));
        }
        let got: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_callbacks_run_in_post_order_on_one_thread() {
        let callbacks = CallbackQueue::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            callbacks.post(move || {
                tx.send((i, thread::current().name().map(str::to_string)))
                    .unwrap()
            });
        }
        callbacks.shutdown();
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 10);
        for (n, (i, name)) in got.into_iter().enumerate() {
            assert_eq!(n, i);
            assert_eq!(name.as_deref(), Some("sharelink-callback-0"));
        }
    }

    #[test]
    fn test_closed_queue_refuses_jobs() {
        let queue = RequestQueue::new(2);
        queue.shutdown();
        assert!(queue.is_closed());
        assert!(queue.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_post_after_shutdown_runs_inline() {
        let callbacks = CallbackQueue::new();
        callbacks.shutdown();
        let (tx, rx) = mpsc::channel();
        callbacks.post(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let queue = RequestQueue::new(1);
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            let _ = queue.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(()).unwrap();
            }));
        }
        queue.shutdown();
        assert_eq!(rx.try_iter().count(), 3);
    }

    fn explode() {
        panic!("job blew up");
    }

    fn explode_formatted() {
        panic!("formatted {}", 7);
    }

    #[test]
    fn test_panicking_callback_keeps_callback_thread() {
        let callbacks = CallbackQueue::new();
        let (tx, rx) = mpsc::channel();
        callbacks.post(explode);
        callbacks.post(move || {
            tx.send(thread::current().name().map(str::to_string))
                .unwrap()
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("sharelink-callback-0"));
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let queue = RequestQueue::new(1);
        let (tx, rx) = mpsc::channel();
        let _ = queue.submit(Box::new(explode));
        let _ = queue.submit(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(explode).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "job blew up");
        let payload = panic::catch_unwind(explode_formatted).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }
}
