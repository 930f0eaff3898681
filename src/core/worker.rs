//! Cancellable workers
//!
//! Every running command (and every pipeline stage it spawns) runs on its own
//! thread as a [`Worker`]. Workers form a tree: a parent owns the list of the
//! children it spawned, children only keep a weak back reference so they can
//! leave the list when they finish.
//!
//! Cancellation is cooperative. [`Worker::kill`] flips a monotonic `killed`
//! flag; the worker's own code observes it at its next
//! [`WorkerContext::checkpoint`] and unwinds with [`WorkerError::Cancelled`]
//! through ordinary `?` propagation, so every lock guard is released on the
//! way out. Before unwinding, children are killed first, depth first.
//!
//! Two strategies:
//!
//! - [`CancelStrategy::Checkpoint`]: `kill` only sets the flag. The cascade to
//!   children happens at the worker's next checkpoint.
//! - [`CancelStrategy::Interrupt`]: `kill` cascades to children immediately and
//!   then interrupts the target thread (unparking it out of
//!   [`WorkerContext::sleep`] and similar waits). If the thread is attaching
//!   or detaching at that moment the outcome is ambiguous: nothing is
//!   published, `killed` stays false and the caller can retry. Once `killed`
//!   is visible it is never reverted.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Unique identifier for a worker
pub type WorkerId = u64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Longest a sleeping worker goes without a checkpoint
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Attempts per child when an interrupt is ambiguous during a cascade
const CASCADE_RETRIES: usize = 64;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker cancelled")]
    Cancelled,

    #[error("cancellation of worker {0} is indeterminate, retry")]
    Ambiguous(WorkerId),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("worker thread panicked")]
    Panicked,
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

/// How a kill request reaches the worker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelStrategy {
    /// Flag only, observed and cascaded at checkpoints
    Checkpoint,
    /// Cascade immediately and interrupt the thread
    #[default]
    Interrupt,
}

/// Outcome of interrupting the worker thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Injection {
    Delivered,
    Finished,
}

/// Called on the worker's thread once it has finished, whether or not its
/// body ever ran
pub type ExitHook = Box<dyn FnOnce(&Worker) + Send>;

struct WorkerShared {
    id: WorkerId,
    name: String,
    strategy: CancelStrategy,
    killed: AtomicBool,
    /// An interrupt has been requested and not yet observed
    pending: AtomicBool,
    signals: AtomicUsize,
    finished: AtomicBool,
    children: Mutex<Vec<Worker>>,
    thread: Mutex<Option<Thread>>,
    parent: Option<Weak<WorkerShared>>,
}

/// Shared handle to a worker. Cloning does not create a new worker.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("killed", &self.is_killed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Worker {
    /// Start a top-level worker running `f` on a new thread.
    pub fn spawn<T, E, F>(
        name: impl Into<String>,
        strategy: CancelStrategy,
        f: F,
    ) -> Result<WorkerHandle<T, E>, WorkerError>
    where
        T: Send + 'static,
        E: From<WorkerError> + Send + 'static,
        F: FnOnce(&WorkerContext) -> Result<T, E> + Send + 'static,
    {
        Self::spawn_inner(name.into(), strategy, None, None, f)
    }

    /// Like [`Worker::spawn`], running `on_exit` after the worker finishes.
    ///
    /// `on_exit` also runs when the worker is killed before its body starts.
    /// It is dropped without running if the thread cannot be spawned.
    pub fn spawn_with_exit_hook<T, E, F>(
        name: impl Into<String>,
        strategy: CancelStrategy,
        on_exit: impl FnOnce(&Worker) + Send + 'static,
        f: F,
    ) -> Result<WorkerHandle<T, E>, WorkerError>
    where
        T: Send + 'static,
        E: From<WorkerError> + Send + 'static,
        F: FnOnce(&WorkerContext) -> Result<T, E> + Send + 'static,
    {
        Self::spawn_inner(name.into(), strategy, None, Some(Box::new(on_exit)), f)
    }

    fn spawn_inner<T, E, F>(
        name: String,
        strategy: CancelStrategy,
        parent: Option<&Worker>,
        on_exit: Option<ExitHook>,
        f: F,
    ) -> Result<WorkerHandle<T, E>, WorkerError>
    where
        T: Send + 'static,
        E: From<WorkerError> + Send + 'static,
        F: FnOnce(&WorkerContext) -> Result<T, E> + Send + 'static,
    {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let worker = Worker {
            shared: Arc::new(WorkerShared {
                id,
                name: name.clone(),
                strategy,
                killed: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                signals: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
                thread: Mutex::new(None),
                parent: parent.map(|p| Arc::downgrade(&p.shared)),
            }),
        };

        // Registered before the thread exists so a concurrent cascade sees it
        if let Some(parent) = parent {
            parent.lock_children().push(worker.clone());
        }

        let thread_worker = worker.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || {
                let _finish = FinishGuard {
                    worker: thread_worker.clone(),
                    on_exit,
                };
                thread_worker.attach_current_thread();
                let ctx = WorkerContext {
                    worker: thread_worker,
                };
                ctx.checkpoint()?;
                f(&ctx)
            });

        match spawned {
            Ok(join) => {
                debug!("Worker {} ({}) started", id, name);
                if parent.map_or(false, Worker::is_killed) {
                    // Spawned while the parent was being torn down
                    if let Err(e) = kill_with_retries(&worker) {
                        warn!("Kill of late child {} failed: {}", id, e);
                    }
                }
                Ok(WorkerHandle { worker, join })
            }
            Err(e) => {
                if let Some(parent) = parent {
                    parent.lock_children().retain(|c| c.id() != id);
                }
                Err(WorkerError::Spawn(e))
            }
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn strategy(&self) -> CancelStrategy {
        self.shared.strategy
    }

    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Interrupts delivered to this worker's thread
    pub fn signal_count(&self) -> usize {
        self.shared.signals.load(Ordering::SeqCst)
    }

    /// Snapshot of the children still running
    pub fn children(&self) -> Vec<Worker> {
        self.lock_children().clone()
    }

    /// Request cancellation of this worker and everything it spawned.
    ///
    /// Idempotent and callable from any thread. Only fails with
    /// [`WorkerError::Ambiguous`], in which case nothing was published:
    /// `killed` is still false and the call may be retried.
    pub fn kill(&self) -> Result<(), WorkerError> {
        if self.is_killed() {
            return Ok(());
        }

        match self.shared.strategy {
            CancelStrategy::Checkpoint => {
                if self.shared.killed.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                debug!("Worker {} marked killed", self.id());
                if self.is_finished() {
                    // No checkpoint left to cascade from
                    self.cascade();
                }
                Ok(())
            }
            CancelStrategy::Interrupt => {
                // Claim the thread slot before the flag becomes visible
                let slot = match self.shared.thread.try_lock() {
                    Ok(slot) => slot,
                    Err(TryLockError::Poisoned(p)) => p.into_inner(),
                    Err(TryLockError::WouldBlock) => {
                        // The thread is attaching or detaching right now
                        warn!("Interrupt of worker {} is ambiguous, not sent", self.id());
                        return Err(WorkerError::Ambiguous(self.id()));
                    }
                };
                if self.shared.killed.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }

                self.cascade();
                match self.inject(slot.as_ref()) {
                    Injection::Delivered => {
                        info!("Worker {} ({}) interrupted", self.id(), self.name());
                    }
                    Injection::Finished => {
                        debug!("Worker {} already finished", self.id());
                    }
                }
                Ok(())
            }
        }
    }

    /// Kill every recorded child, depth first.
    fn cascade(&self) {
        for child in self.children() {
            if let Err(e) = kill_with_retries(&child) {
                // The parent's next checkpoint cascades again
                warn!("Cascade to worker {} failed: {}", child.id(), e);
            }
        }
    }

    /// Wake the thread. The caller holds the thread slot.
    fn inject(&self, thread: Option<&Thread>) -> Injection {
        if self.is_finished() {
            return Injection::Finished;
        }

        self.shared.pending.store(true, Ordering::SeqCst);
        self.shared.signals.fetch_add(1, Ordering::SeqCst);
        if let Some(thread) = thread {
            thread.unpark();
        }
        Injection::Delivered
    }

    fn attach_current_thread(&self) {
        *lock_recover(&self.shared.thread) = Some(thread::current());
    }

    fn lock_children(&self) -> MutexGuard<'_, Vec<Worker>> {
        lock_recover(&self.shared.children)
    }

    #[cfg(test)]
    fn hold_thread_slot(&self) -> MutexGuard<'_, Option<Thread>> {
        lock_recover(&self.shared.thread)
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Kill, retrying while the outcome is ambiguous.
fn kill_with_retries(worker: &Worker) -> Result<(), WorkerError> {
    let mut result = worker.kill();
    for _ in 0..CASCADE_RETRIES {
        if !matches!(result, Err(WorkerError::Ambiguous(_))) {
            break;
        }
        thread::yield_now();
        result = worker.kill();
    }
    result
}

/// Marks the worker finished, detaches it from its parent and runs its exit
/// hook, even when the worker body panics or never starts.
struct FinishGuard {
    worker: Worker,
    on_exit: Option<ExitHook>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let shared = &self.worker.shared;
        {
            let mut slot = lock_recover(&shared.thread);
            *slot = None;
            shared.finished.store(true, Ordering::SeqCst);
        }

        if let Some(parent) = shared.parent.as_ref().and_then(Weak::upgrade) {
            lock_recover(&parent.children).retain(|c| c.id() != shared.id);
        }
        debug!("Worker {} ({}) finished", shared.id, shared.name);

        if let Some(on_exit) = self.on_exit.take() {
            on_exit(&self.worker);
        }
    }
}

/// Handed to the worker body; the only way to observe cancellation.
pub struct WorkerContext {
    worker: Worker,
}

impl WorkerContext {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn is_killed(&self) -> bool {
        self.worker.is_killed()
    }

    /// Unwind with [`WorkerError::Cancelled`] if a kill was requested.
    ///
    /// Children are killed before this returns the error.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if !self.worker.is_killed() {
            return Ok(());
        }
        self.worker.cascade();
        self.worker.shared.pending.store(false, Ordering::SeqCst);
        Err(WorkerError::Cancelled)
    }

    /// Sleep, waking early when interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_timeout((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Start a child worker with this worker's strategy.
    pub fn spawn_child<T, E, F>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> Result<WorkerHandle<T, E>, WorkerError>
    where
        T: Send + 'static,
        E: From<WorkerError> + Send + 'static,
        F: FnOnce(&WorkerContext) -> Result<T, E> + Send + 'static,
    {
        self.checkpoint()?;
        Worker::spawn_inner(name.into(), self.worker.strategy(), Some(&self.worker), None, f)
    }
}

/// Owner of a worker's thread
pub struct WorkerHandle<T, E> {
    worker: Worker,
    join: JoinHandle<Result<T, E>>,
}

impl<T, E: From<WorkerError>> WorkerHandle<T, E> {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker thread; a panic surfaces as [`WorkerError::Panicked`].
    pub fn join(self) -> Result<T, E> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(E::from(WorkerError::Panicked)))
    }
}
