//! Worker pools that serialize filesystem operations onto long-lived
//! HTTP-capable workers. Submitters block on a one-shot completion; the
//! background pool takes the same work items but nobody waits on them.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::http::request::HttpRequest;

pub type Thunk = Box<dyn FnOnce(&mut HttpRequest) -> i32 + Send + 'static>;

/// Builds one executor per worker. Construction can fail (e.g. an unreadable
/// CA file), in which case the affected item fails with EIO and the worker
/// tries again on the next item.
pub type ExecutorFactory = Arc<dyn Fn() -> crate::Result<HttpRequest> + Send + Sync>;

/// A deferred operation: a closure consuming one executor, paired with a
/// one-shot completion carrying the integer result (0 or a negative errno).
pub struct WorkItem {
    thunk: Mutex<Option<Thunk>>,
    result: Mutex<Option<i32>>,
    done: Condvar,
}

impl WorkItem {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: FnOnce(&mut HttpRequest) -> i32 + Send + 'static,
    {
        Arc::new(Self {
            thunk: Mutex::new(Some(Box::new(f))),
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    /// Block until a worker completes the thunk; returns its result.
    pub fn wait(&self) -> i32 {
        let mut result = self.result.lock();
        while result.is_none() {
            self.done.wait(&mut result);
        }
        result.unwrap_or(-libc::EIO)
    }

    /// Non-blocking peek, for callers that poll instead of waiting.
    pub fn try_result(&self) -> Option<i32> {
        *self.result.lock()
    }

    fn take_thunk(&self) -> Option<Thunk> {
        self.thunk.lock().take()
    }

    /// First completion wins; later calls are ignored so a result is
    /// observed exactly once.
    fn complete(&self, result: i32) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.done.notify_all();
        }
    }
}

struct PoolState {
    queue: VecDeque<Arc<WorkItem>>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size pool of workers, each owning one executor for its lifetime.
/// Scheduling is cooperative FIFO; there is no priority.
pub struct WorkerPool {
    name: String,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, worker_count: usize, factory: ExecutorFactory) -> Self {
        let name = name.into();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let shared = shared.clone();
                let factory = factory.clone();
                let thread_name = format!("{name}-{index}");
                let panic_name = thread_name.clone();
                std::thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || worker_loop(&thread_name, &shared, &factory))
                    .unwrap_or_else(|e| panic!("failed to spawn {panic_name}: {e}"))
            })
            .collect();

        Self {
            name,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a work item. Returns immediately; an item posted to a pool
    /// that is shutting down completes with ESHUTDOWN.
    pub fn post(&self, item: Arc<WorkItem>) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.queue.push_back(item);
                self.shared.available.notify_one();
                return;
            }
        }
        item.complete(-libc::ESHUTDOWN);
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Wake all workers, fail every pending item with ESHUTDOWN, and join.
    /// Items already claimed by a worker run to completion.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<WorkItem>> = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.drain(..).collect()
        };
        self.shared.available.notify_all();

        for item in drained {
            drop(item.take_thunk());
            item.complete(-libc::ESHUTDOWN);
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        debug!(pool = %self.name, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(thread_name: &str, shared: &PoolShared, factory: &ExecutorFactory) {
    let mut executor: Option<HttpRequest> = None;

    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if let Some(item) = state.queue.pop_front() {
                    break item;
                }
                if state.shutdown {
                    return;
                }
                shared.available.wait(&mut state);
            }
        };

        let Some(thunk) = item.take_thunk() else {
            continue;
        };

        if executor.is_none() {
            match factory() {
                Ok(exec) => executor = Some(exec),
                Err(err) => {
                    warn!(worker = thread_name, error = %err, "cannot build executor");
                    item.complete(-libc::EIO);
                    continue;
                }
            }
        }
        let Some(exec) = executor.as_mut() else {
            continue;
        };

        let result = catch_unwind(AssertUnwindSafe(|| thunk(exec)));
        match result {
            Ok(code) => item.complete(code),
            Err(_) => {
                warn!(worker = thread_name, "work item panicked");
                item.complete(-libc::EIO);
                // The executor may be mid-transaction; start fresh.
                executor = None;
                continue;
            }
        }

        // A canceled executor (deadline expiry) is unusable; replace it
        // before the next item.
        if executor.as_ref().is_some_and(HttpRequest::is_canceled) {
            executor = None;
        }
    }
}
