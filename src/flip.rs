//! Asynchronous flip execution
//!
//! A [`FlipQueue`] owns one worker thread that runs presentation jobs in submission order.
//! The queue prefers the latest frame: once more than `backlog` jobs are waiting, the oldest
//! waiting jobs are dropped. Jobs never get reordered.
//!
//! ```
//! use scanout::flip::FlipQueue;
//! use std::sync::mpsc;
//!
//! let queue = FlipQueue::new("flip-example").unwrap();
//! let (tx, rx) = mpsc::channel();
//! queue.enqueue(move || tx.send(42).unwrap());
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info_span, trace, warn};

/// Backlog depth used by [`FlipQueue::new`]
pub const DEFAULT_BACKLOG: usize = 1;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    backlog: usize,
    dropped: AtomicUsize,
    executed: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // jobs never run under the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work queue with a dedicated worker thread executing flip jobs
pub struct FlipQueue {
    name: String,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for FlipQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlipQueue")
            .field("name", &self.name)
            .field("backlog", &self.shared.backlog)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .field("executed", &self.executed())
            .finish()
    }
}

impl FlipQueue {
    /// Spawn a queue keeping at most [`DEFAULT_BACKLOG`] job waiting
    pub fn new(name: impl Into<String>) -> io::Result<FlipQueue> {
        FlipQueue::with_backlog(name, DEFAULT_BACKLOG)
    }

    /// Spawn a queue keeping at most `backlog` jobs waiting.
    ///
    /// A backlog of zero is treated as one, the newest job is always kept.
    pub fn with_backlog(name: impl Into<String>, backlog: usize) -> io::Result<FlipQueue> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            backlog: backlog.max(1),
            dropped: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
        });

        let worker_shared = shared.clone();
        let span = info_span!("flip_queue", name = %name);
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = span.enter();
                run(&worker_shared);
            })?;
        debug!(name = %name, backlog = shared.backlog, "flip worker started");

        Ok(FlipQueue {
            name,
            shared,
            worker: Some(worker),
        })
    }

    /// Append a job and wake the worker.
    ///
    /// Never blocks on the worker. Jobs enqueued after [`FlipQueue::stop`] are discarded.
    #[profiling::function]
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.stop {
            debug!(name = %self.name, "queue stopped, discarding job");
            return;
        }

        state.jobs.push_back(Box::new(job));
        while state.jobs.len() > self.shared.backlog {
            state.jobs.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(name = %self.name, dropped, "flip backlog exceeded, dropping oldest pending flip");
        }
        drop(state);

        self.shared.wake.notify_one();
    }

    /// Ask the worker to exit.
    ///
    /// Pending jobs are not run. A job that is already running is finished.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if !state.stop {
            state.stop = true;
            trace!(name = %self.name, pending = state.jobs.len(), "stopping flip worker");
        }
        drop(state);
        self.shared.wake.notify_all();
    }

    /// Name of the worker thread
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of jobs waiting for the worker
    pub fn backlog(&self) -> usize {
        self.shared.backlog
    }

    /// Number of jobs waiting for the worker
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Number of jobs dropped because the backlog was exceeded
    pub fn dropped(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Number of jobs the worker ran to completion
    pub fn executed(&self) -> usize {
        self.shared.executed.load(Ordering::Acquire)
    }
}

impl Drop for FlipQueue {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(name = %self.name, "flip worker panicked");
            }
        }
        debug!(name = %self.name, "flip worker joined");
    }
}

fn run(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.stop {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        profiling::scope!("flip job");
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("flip job panicked");
        }
        shared.executed.fetch_add(1, Ordering::Release);
    }
}
