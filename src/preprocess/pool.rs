//! Bounded background pool with per-task serial queues
//!
//! The pool is a fixed set of named std threads pulling jobs from one shared
//! multi-consumer channel. A [`SerialQueue`] sits on top of the pool: jobs dispatched to the
//! same queue run one at a time and in dispatch order, even though they may
//! land on different pool threads.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{IdbError, Result};

/// Unit of work run on a pool thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum PoolMessage {
    Run(Job),
    Shutdown,
}

/// Fixed-size thread pool
pub struct PreprocessPool {
    sender: Sender<PoolMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl PreprocessPool {
    /// Spawn `threads` workers (at least one)
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<PoolMessage>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("idb-preprocess-{}", index))
                .spawn(move || worker_loop(index, rx))
                .map_err(|e| IdbError::Internal(format!("failed to spawn preprocess thread: {}", e)))?;
            workers.push(handle);
        }
        log::debug!("Preprocess pool started with {} threads", threads);

        Ok(Self { sender: tx, workers })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run a job on any pool thread. Returns false if the pool is shutting down.
    pub fn execute(&self, job: Job) -> bool {
        self.sender.send(PoolMessage::Run(job)).is_ok()
    }

    /// Create a new serial queue backed by this pool
    pub fn serial_queue(&self) -> SerialQueue {
        SerialQueue {
            inner: Arc::new(SerialInner {
                pool: self.sender.clone(),
                state: Mutex::new(SerialState {
                    jobs: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Stop the workers after the jobs already queued
    pub fn shutdown(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(PoolMessage::Shutdown);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PreprocessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: Receiver<PoolMessage>) {
    loop {
        match rx.recv() {
            Ok(PoolMessage::Run(job)) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("Preprocess job panicked on worker {}", index);
                }
            }
            Ok(PoolMessage::Shutdown) | Err(_) => {
                log::debug!("Preprocess worker {} shutting down", index);
                return;
            }
        }
    }
}

struct SerialState {
    jobs: VecDeque<Job>,
    /// A drain job is queued or running on the pool
    draining: bool,
}

struct SerialInner {
    pool: Sender<PoolMessage>,
    state: Mutex<SerialState>,
}

/// Ordered queue of jobs sharing the pool
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<SerialInner>,
}

impl SerialQueue {
    /// Queue a job behind every job previously dispatched to this queue.
    /// Returns false if the pool is gone.
    pub fn dispatch(&self, job: Job) -> bool {
        let start_drain = {
            let mut state = lock(&self.inner.state);
            state.jobs.push_back(job);
            !std::mem::replace(&mut state.draining, true)
        };

        if !start_drain {
            return true;
        }

        let inner = Arc::clone(&self.inner);
        let drain: Job = Box::new(move || drain(inner));
        let sent = self.inner.pool.send(PoolMessage::Run(drain)).is_ok();
        if !sent {
            let mut state = lock(&self.inner.state);
            state.jobs.clear();
            state.draining = false;
        }
        sent
    }
}

fn lock(state: &Mutex<SerialState>) -> MutexGuard<'_, SerialState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn drain(inner: Arc<SerialInner>) {
    loop {
        let job = {
            let mut state = lock(&inner.state);
            match state.jobs.pop_front() {
                Some(job) => job,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Serial queue job panicked");
        }
    }
}
