//! Deduplicated async request queue with priority-based concurrent execution
//!
//! Every request carries a key. While a request for a key is outstanding,
//! further requests for the same key attach to it instead of starting new
//! work, so there is at most one in-flight job per key. Jobs run on tokio;
//! results are collected by polling from the owning (synchronous) thread.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};

use crate::core::error::Error;
use crate::core::types::{BoxFuture, Result};

/// Identity of one outstanding request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTicket(pub u64);

/// Work item handed to the worker loop
struct Job<K, T> {
    key: K,
    ticket: RequestTicket,
    priority: f32,
    future: BoxFuture<Result<T>>,
}

/// Outcome of a finished request
#[derive(Debug)]
pub struct TaskResult<K, T> {
    pub key: K,
    pub ticket: RequestTicket,
    pub outcome: Result<T>,
}

/// Concurrent keyed task queue
pub struct TaskQueue<K, T> {
    /// Channel for sending jobs to the worker loop
    request_tx: mpsc::UnboundedSender<Job<K, T>>,
    /// Channel for receiving finished jobs
    result_rx: mpsc::UnboundedReceiver<TaskResult<K, T>>,
    /// Outstanding requests by key
    pending: HashMap<K, RequestTicket>,
    next_ticket: u64,
    /// Futures actually constructed (deduplicated requests excluded)
    submitted: u64,
    handle: Handle,
    /// Dedicated runtime, `None` when running on a caller's runtime
    runtime: Option<Runtime>,
}

impl<K, T> TaskQueue<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    T: Send + 'static,
{
    /// Create a task queue with its own multi-threaded runtime
    ///
    /// # Arguments
    /// * `max_concurrent` - Maximum number of jobs running at once
    pub fn new(max_concurrent: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("terrastream-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let mut queue = Self::with_handle(handle, max_concurrent);
        queue.runtime = Some(runtime);
        Ok(queue)
    }

    /// Create a task queue on an existing runtime
    ///
    /// [`wait_for_results`](Self::wait_for_results) must not be called from
    /// inside that runtime.
    pub fn with_handle(handle: Handle, max_concurrent: usize) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Job<K, T>>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TaskResult<K, T>>();

        handle.spawn(Self::worker_loop(max_concurrent.max(1), request_rx, result_tx));

        Self {
            request_tx,
            result_rx,
            pending: HashMap::new(),
            next_ticket: 0,
            submitted: 0,
            handle,
            runtime: None,
        }
    }

    /// Worker loop that runs jobs with concurrency control
    async fn worker_loop(
        max_concurrent: usize,
        mut request_rx: mpsc::UnboundedReceiver<Job<K, T>>,
        result_tx: mpsc::UnboundedSender<TaskResult<K, T>>,
    ) {
        let mut active_tasks: JoinSet<Result<T>> = JoinSet::new();
        let mut active_keys: HashMap<Id, (K, RequestTicket)> = HashMap::new();
        let mut queued: Vec<Job<K, T>> = Vec::new();

        loop {
            tokio::select! {
                Some(job) = request_rx.recv() => {
                    queued.push(job);
                }

                Some(joined) = active_tasks.join_next_with_id(), if !active_tasks.is_empty() => {
                    let (id, outcome) = match joined {
                        Ok((id, outcome)) => (id, outcome),
                        Err(e) => {
                            let id = e.id();
                            (id, Err(Error::Backend(format!("task panicked: {}", e))))
                        }
                    };
                    if let Some((key, ticket)) = active_keys.remove(&id) {
                        let _ = result_tx.send(TaskResult { key, ticket, outcome });
                    }
                }

                // Exit when the queue is gone and no more work remains
                else => {
                    if queued.is_empty() && active_tasks.is_empty() {
                        break;
                    }
                }
            }

            // Start new jobs while there is capacity, highest priority first
            while active_tasks.len() < max_concurrent && !queued.is_empty() {
                queued.sort_by(|a, b| b.priority.total_cmp(&a.priority));
                let job = queued.remove(0);

                let abort = active_tasks.spawn(job.future);
                active_keys.insert(abort.id(), (job.key, job.ticket));
            }
        }
    }

    /// Request work for `key`
    ///
    /// If a request for `key` is already outstanding its ticket is returned
    /// and `make_future` is not called. Higher `priority` starts first.
    pub fn request<F>(&mut self, key: K, priority: f32, make_future: F) -> RequestTicket
    where
        F: FnOnce() -> BoxFuture<Result<T>>,
    {
        if let Some(ticket) = self.pending.get(&key) {
            return *ticket;
        }

        self.next_ticket += 1;
        let ticket = RequestTicket(self.next_ticket);

        let job = Job {
            key: key.clone(),
            ticket,
            priority,
            future: make_future(),
        };
        self.submitted += 1;

        if self.request_tx.send(job).is_err() {
            log::error!("Task worker stopped, dropping request {:?}", key);
            return ticket;
        }

        self.pending.insert(key, ticket);
        ticket
    }

    fn complete(&mut self, result: &TaskResult<K, T>) {
        if self.pending.get(&result.key) == Some(&result.ticket) {
            self.pending.remove(&result.key);
        }
    }

    /// Drain finished jobs without blocking
    ///
    /// The pending entry of every returned job is cleared whatever its
    /// outcome, so a failed key can be requested again.
    pub fn poll_results(&mut self) -> Vec<TaskResult<K, T>> {
        let mut results = Vec::new();

        while let Ok(result) = self.result_rx.try_recv() {
            self.complete(&result);
            results.push(result);
        }

        results
    }

    /// Block until at least one job finishes or `timeout` passes
    pub fn wait_for_results(&mut self, timeout: Duration) -> Vec<TaskResult<K, T>> {
        let mut results = self.poll_results();
        if !results.is_empty() || self.pending.is_empty() {
            return results;
        }

        let handle = self.handle.clone();
        let received = handle.block_on(async {
            tokio::time::timeout(timeout, self.result_rx.recv()).await
        });

        if let Ok(Some(result)) = received {
            self.complete(&result);
            results.push(result);
            results.extend(self.poll_results());
        }

        results
    }

    /// Block until nothing is pending or `timeout` passes
    pub fn wait_until_idle(&mut self, timeout: Duration) -> Vec<TaskResult<K, T>> {
        let deadline = Instant::now() + timeout;
        let mut results = self.poll_results();

        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            results.extend(self.wait_for_results(remaining));
        }

        results
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of futures constructed so far
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl<K, T> Drop for TaskQueue<K, T> {
    fn drop(&mut self) {
        // Jobs still running are dropped with the runtime; their results
        // would be discarded anyway.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
