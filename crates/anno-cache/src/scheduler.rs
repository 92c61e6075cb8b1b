//! Background write-back of cache files.
//!
//! Writes are queued by key and each queue is drained by exactly one runner at a time, so two
//! writes with the same key never overlap and complete in submission order. The store keys
//! writes by container directory, which also serializes every write of one file. Different
//! keys run concurrently on the configured executor.

use crate::error::CacheError;
use crate::lock::CacheFileLock;
use crate::options::WriteThreads;
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work producing one cache file.
pub type WriteJob = Box<dyn FnOnce() -> Result<(), CacheError> + Send + 'static>;

/// What [`WriteScheduler::shutdown`] does with queued writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run everything already queued.
    Drain,
    /// Drop queued writes; writes already running still finish.
    Discard,
}

/// Counters since the scheduler was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    pub discarded: u64,
}

enum Executor {
    Rayon(ThreadPool),
    /// One short-lived thread per queue.
    Threads,
    Inline,
}

fn build_writer_pool(threads: usize) -> Executor {
    let mut threads = threads.max(1);
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("anno-cache-writer-{idx}"))
            .build()
        {
            Ok(pool) => return Executor::Rayon(pool),
            Err(err) if threads > 1 => {
                tracing::debug!(
                    target = "anno.cache",
                    threads,
                    error = %err,
                    "failed to build writer pool; retrying with fewer threads"
                );
                threads = (threads / 2).max(1);
            }
            Err(err) => {
                tracing::warn!(
                    target = "anno.cache",
                    error = %err,
                    "failed to build writer pool; cache writes will run inline"
                );
                return Executor::Inline;
            }
        }
    }
}

struct KeyQueue {
    jobs: VecDeque<WriteJob>,
}

#[derive(Default)]
struct State {
    /// Present while a runner owns the key.
    queues: HashMap<PathBuf, KeyQueue>,
    pending: usize,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    idle: Condvar,
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

pub struct WriteScheduler {
    shared: Arc<Shared>,
    executor: Executor,
}

impl WriteScheduler {
    pub fn new(threads: WriteThreads) -> Self {
        let executor = match threads {
            WriteThreads::Bounded(n) => build_writer_pool(n),
            WriteThreads::Unbounded => Executor::Threads,
        };
        Self::with_executor(executor)
    }

    /// A scheduler that performs every write on the submitting thread.
    pub fn inline() -> Self {
        Self::with_executor(Executor::Inline)
    }

    fn with_executor(executor: Executor) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                idle: Condvar::new(),
                submitted: AtomicU64::new(0),
                written: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
            executor,
        }
    }

    /// Queues `job` behind every earlier write submitted under `key`.
    ///
    /// Returns `false` if the scheduler is shut down; the job is dropped.
    pub fn submit<F>(&self, key: PathBuf, job: F) -> bool
    where
        F: FnOnce() -> Result<(), CacheError> + Send + 'static,
    {
        let start_runner = {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target = "anno.cache",
                    key = %key.display(),
                    "write submitted after shutdown; dropped"
                );
                return false;
            }
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            state.pending += 1;
            match state.queues.get_mut(&key) {
                Some(queue) => {
                    queue.jobs.push_back(Box::new(job));
                    false
                }
                None => {
                    let mut jobs = VecDeque::new();
                    jobs.push_back(Box::new(job) as WriteJob);
                    state.queues.insert(key.clone(), KeyQueue { jobs });
                    true
                }
            }
        };

        if start_runner {
            self.start_runner(key);
        }
        true
    }

    fn start_runner(&self, key: PathBuf) {
        match &self.executor {
            Executor::Rayon(pool) => {
                let shared = Arc::clone(&self.shared);
                pool.spawn(move || shared.drain_queue(&key));
            }
            Executor::Threads => {
                let shared = Arc::clone(&self.shared);
                let thread_key = key.clone();
                let spawned = std::thread::Builder::new()
                    .name("anno-cache-writer".to_string())
                    .spawn(move || shared.drain_queue(&thread_key));
                if let Err(err) = spawned {
                    tracing::debug!(
                        target = "anno.cache",
                        error = %err,
                        "failed to spawn writer thread; writing inline"
                    );
                    self.shared.drain_queue(&key);
                }
            }
            Executor::Inline => self.shared.drain_queue(&key),
        }
    }

    /// Number of writes queued or running.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> WriteStats {
        WriteStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            written: self.shared.written.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Blocks until no write is queued or running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Like [`WriteScheduler::wait_idle`], giving up after `timeout`. Returns whether the
    /// scheduler became idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            if self
                .shared
                .idle
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.pending == 0;
            }
        }
        true
    }

    /// Stops accepting writes and settles the queued ones according to `mode`.
    ///
    /// Returns once nothing is running. Calling it again is harmless.
    pub fn shutdown(&self, mode: ShutdownMode) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            if mode == ShutdownMode::Discard {
                let mut dropped = 0;
                for queue in state.queues.values_mut() {
                    dropped += queue.jobs.len();
                    queue.jobs.clear();
                }
                state.pending -= dropped;
                self.shared
                    .discarded
                    .fetch_add(dropped as u64, Ordering::Relaxed);
                if dropped > 0 {
                    tracing::debug!(
                        target = "anno.cache",
                        dropped,
                        "discarded queued cache writes"
                    );
                }
                if state.pending == 0 {
                    self.shared.idle.notify_all();
                }
            }
        }
        self.wait_idle();
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Drain);
    }
}

impl Shared {
    /// Runs the jobs of one key until its queue is empty, then releases the key.
    fn drain_queue(&self, key: &Path) {
        loop {
            let job = {
                let mut state = self.state.lock();
                let next = state
                    .queues
                    .get_mut(key)
                    .and_then(|queue| queue.jobs.pop_front());
                match next {
                    Some(job) => job,
                    None => {
                        state.queues.remove(key);
                        return;
                    }
                }
            };

            let result = {
                let _lock = CacheFileLock::lock_exclusive(key);
                panic::catch_unwind(AssertUnwindSafe(job))
            };
            match result {
                Ok(Ok(())) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target = "anno.cache",
                        key = %key.display(),
                        error = %err,
                        "cache write failed"
                    );
                }
                Err(payload) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        target = "anno.cache",
                        key = %key.display(),
                        panic = %panic_message(payload.as_ref()),
                        "cache write panicked"
                    );
                }
            }

            let mut state = self.state.lock();
            state.pending -= 1;
            if state.pending == 0 {
                self.idle.notify_all();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
