// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Worker pool and completion gates for asynchronous segment work.
//!
//! The pool drains three FIFO bands strictly high-to-low. Encode jobs for
//! hidden streams run at high priority: they are the backbone of composite
//! encoders and must not starve behind fresh client work. Prefetch reads
//! run at low priority.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::StreamSegmentLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queues {
    bands: [VecDeque<Job>; 3],
    shutdown: bool,
}

/// Fixed set of threads draining the prioritised job queue.
pub struct WorkerPool {
    queues: Mutex<Queues>,
    available: Condvar,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Arc<Self> {
        let pool = Arc::new(WorkerPool {
            queues: Mutex::new(Queues {
                bands: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                shutdown: false,
            }),
            available: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = pool.threads.lock();
        for i in 0..thread_count.max(1) {
            let worker = pool.clone();
            let handle = std::thread::Builder::new()
                .name(format!("segment-worker-{i}"))
                .spawn(move || worker.run())
                .expect("spawn worker thread");
            threads.push(handle);
        }
        drop(threads);

        debug!(threads = thread_count.max(1), "Worker pool started");
        pool
    }

    pub fn submit<F>(&self, priority: Priority, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queues = self.queues.lock();
        if queues.shutdown {
            warn!("Job submitted to a worker pool that is shutting down; dropped");
            return;
        }
        queues.bands[priority as usize].push_back(Box::new(job));
        drop(queues);
        self.available.notify_one();
    }

    fn run(&self) {
        loop {
            let job = {
                let mut queues = self.queues.lock();
                loop {
                    if let Some(job) = queues
                        .bands
                        .iter_mut()
                        .find_map(|band| band.pop_front())
                    {
                        break Some(job);
                    }
                    if queues.shutdown {
                        break None;
                    }
                    self.available.wait(&mut queues);
                }
            };

            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }

    /// Stops the pool after the queued jobs drained. Called once on server
    /// teardown.
    pub fn shutdown(&self) {
        {
            let mut queues = self.queues.lock();
            queues.shutdown = true;
        }
        self.available.notify_all();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

// ─────────────────────────────── wait gates ──────────────────────────────────

const ERROR_RING_CAPACITY: usize = 64;

struct WaitState {
    pending: u32,
    errors: VecDeque<StreamSegmentLink>,
}

/// Reference-counted completion gate. Callers `increment` before handing a
/// dependent operation to the pool; the completing side `decrement`s on
/// success or `push_error`s and `decrement`s on failure. `wait` blocks until
/// the count reaches zero and reports whether any errors were pushed.
pub struct StreamWait {
    state: Mutex<WaitState>,
    done: Condvar,
}

impl Default for StreamWait {
    fn default() -> Self {
        StreamWait::new()
    }
}

impl StreamWait {
    pub fn new() -> Self {
        StreamWait {
            state: Mutex::new(WaitState { pending: 0, errors: VecDeque::new() }),
            done: Condvar::new(),
        }
    }

    pub fn increment(&self) {
        self.state.lock().pending += 1;
    }

    pub fn decrement(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending > 0);
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.done.notify_all();
        }
    }

    pub fn push_error(&self, link: StreamSegmentLink) {
        let mut state = self.state.lock();
        if state.errors.len() == ERROR_RING_CAPACITY {
            state.errors.pop_front();
        }
        state.errors.push_back(link);
    }

    pub fn pop_error(&self) -> Option<StreamSegmentLink> {
        self.state.lock().errors.pop_front()
    }

    pub fn count(&self) -> u32 {
        self.state.lock().pending
    }

    /// Blocks until all pending operations completed. Returns `false` iff
    /// any completion reported an error.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.done.wait(&mut state);
        }
        state.errors.is_empty()
    }

    /// Like `wait`, but gives up after `timeout`. `None` means operations
    /// were still pending when the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.pending > 0 {
            if self.done.wait_until(&mut state, deadline).timed_out() {
                if state.pending > 0 {
                    return None;
                }
                break;
            }
        }
        Some(state.errors.is_empty())
    }
}
