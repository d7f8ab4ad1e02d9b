//! Priority task queue
//!
//! Runs boxed futures with bounded concurrency, optional admission rate
//! limiting and an optional per-task timeout. Waiting tasks are ordered by
//! priority (higher first) and then by submission order.
//!
//! A single dispatcher task owns admission: it takes a concurrency permit,
//! waits for a rate token and only then pops the best waiting task, so a
//! higher-priority task submitted while the dispatcher was throttled still
//! runs first.

use crate::ratelimit::RateLimiter;
use forecache_common::EngineStats;
use forecache_common::config::QueueConfig;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Task priority; 0 is routine work, anything higher is a manual request
pub type Priority = u32;

/// Priority of scheduled work
pub const DEFAULT_PRIORITY: Priority = 0;

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    TimedOut,
    /// The queue went away before the task ran
    Cancelled,
}

impl TaskOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Completion handle returned by [`TaskQueue::enqueue`]; may be dropped
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the task to finish
    pub async fn wait(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

/// Counters and gauges for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub name: String,
    /// Tasks waiting for admission
    pub waiting: usize,
    /// Tasks currently running
    pub running: usize,
    pub concurrency: usize,
    pub paused: bool,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

struct Job {
    priority: Priority,
    seq: u64,
    task: BoxFuture<'static, Result<(), String>>,
    done: oneshot::Sender<TaskOutcome>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    waiting: BinaryHeap<Job>,
    running: usize,
    next_seq: u64,
}

struct Inner {
    name: String,
    concurrency: usize,
    timeout: Option<Duration>,
    state: Mutex<State>,
    semaphore: Arc<Semaphore>,
    limiter: Option<RateLimiter>,
    paused: AtomicBool,
    /// Wakes the dispatcher on enqueue and resume
    wake: Notify,
    /// Wakes `drain` callers whenever a task finishes
    idle: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    stats: Arc<EngineStats>,
}

/// Bounded, rate-limited priority queue of async tasks
pub struct TaskQueue {
    inner: Arc<Inner>,
    dispatcher: JoinHandle<()>,
}

impl TaskQueue {
    /// Create a queue and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>, config: &QueueConfig, stats: Arc<EngineStats>) -> Self {
        let concurrency = config.concurrency.max(1);
        let inner = Arc::new(Inner {
            name: name.into(),
            concurrency,
            timeout: config.timeout(),
            state: Mutex::new(State::default()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            limiter: RateLimiter::new(config.interval_cap, config.interval()),
            paused: AtomicBool::new(false),
            wake: Notify::new(),
            idle: Notify::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            stats,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner)));
        Self { inner, dispatcher }
    }

    /// Submit a task. Returns immediately.
    pub fn enqueue<F, E>(&self, priority: Priority, task: F) -> TaskHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let (done, rx) = oneshot::channel();
        let task = async move { task.await.map_err(|e| e.to_string()) }.boxed();
        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(Job {
                priority,
                seq,
                task,
                done,
            });
        }
        self.inner.wake.notify_one();
        TaskHandle { rx }
    }

    /// Tasks waiting for admission
    pub fn size(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Tasks currently running
    pub fn pending(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Stop admitting tasks; running tasks are unaffected
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        debug!("Queue {} paused", self.inner.name);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        debug!("Queue {} resumed", self.inner.name);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is waiting or running.
    ///
    /// Never resolves while the queue is paused with waiting tasks.
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            {
                let state = self.inner.state.lock();
                if state.waiting.is_empty() && state.running == 0 {
                    return;
                }
            }
            idle.await;
        }
    }

    pub fn status(&self) -> QueueStatus {
        let (waiting, running) = {
            let state = self.inner.state.lock();
            (state.waiting.len(), state.running)
        };
        QueueStatus {
            name: self.inner.name.clone(),
            waiting,
            running,
            concurrency: self.inner.concurrency,
            paused: self.is_paused(),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(inner: Arc<Inner>) {
    loop {
        let Ok(permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
            return;
        };

        loop {
            let ready =
                !inner.paused.load(Ordering::SeqCst) && !inner.state.lock().waiting.is_empty();
            if ready {
                break;
            }
            inner.wake.notified().await;
        }

        if let Some(limiter) = &inner.limiter {
            limiter.acquire().await;
        }

        let job = {
            let mut state = inner.state.lock();
            if inner.paused.load(Ordering::SeqCst) {
                None
            } else {
                let job = state.waiting.pop();
                if job.is_some() {
                    state.running += 1;
                }
                job
            }
        };
        let Some(job) = job else {
            continue;
        };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let outcome = run_job(&inner, job.task).await;
            drop(permit);
            inner.state.lock().running -= 1;
            inner.idle.notify_waiters();
            let _ = job.done.send(outcome);
        });
    }
}

async fn run_job(inner: &Inner, task: BoxFuture<'static, Result<(), String>>) -> TaskOutcome {
    let guarded = AssertUnwindSafe(task).catch_unwind();
    let result = match inner.timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Task in queue {} timed out after {:?}",
                    inner.name, limit
                );
                inner.timed_out.fetch_add(1, Ordering::Relaxed);
                inner.stats.record_timeout();
                return TaskOutcome::TimedOut;
            }
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(())) => {
            inner.completed.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Completed
        }
        Ok(Err(e)) => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Failed(e)
        }
        Err(_) => {
            warn!("Task in queue {} panicked", inner.name);
            inner.failed.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Failed("task panicked".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(concurrency: usize, timeout_ms: u64) -> QueueConfig {
        QueueConfig {
            concurrency,
            interval_ms: 1000,
            interval_cap: 0,
            timeout_ms,
        }
    }

    fn queue(concurrency: usize, timeout_ms: u64) -> TaskQueue {
        TaskQueue::new("test", &config(concurrency, timeout_ms), Arc::new(EngineStats::new()))
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = queue(1, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.pause();
        let mut handles = Vec::new();
        for priority in [0, 1, 2, 0] {
            let order = Arc::clone(&order);
            handles.push(queue.enqueue(priority, async move {
                order.lock().push(priority);
                Ok::<(), String>(())
            }));
        }
        assert_eq!(queue.size(), 4);
        queue.resume();
        queue.drain().await;

        assert_eq!(*order.lock(), vec![2, 1, 0, 0]);
        for handle in handles {
            assert_eq!(handle.wait().await, TaskOutcome::Completed);
        }
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = queue(1, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.pause();
        for id in 0..5 {
            let order = Arc::clone(&order);
            queue.enqueue(DEFAULT_PRIORITY, async move {
                order.lock().push(id);
                Ok::<(), String>(())
            });
        }
        queue.resume();
        queue.drain().await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let queue = queue(2, 0);
        let current = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        for _ in 0..6 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            queue.enqueue(DEFAULT_PRIORITY, async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }
        queue.drain().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.status().completed, 6);
    }

    #[tokio::test]
    async fn test_timeout_counts_failure() {
        let stats = Arc::new(EngineStats::new());
        let queue = TaskQueue::new("test", &config(1, 20), Arc::clone(&stats));

        let handle = queue.enqueue(DEFAULT_PRIORITY, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        });
        assert_eq!(handle.wait().await, TaskOutcome::TimedOut);
        queue.drain().await;

        assert_eq!(queue.status().timed_out, 1);
        assert_eq!(stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stall() {
        let queue = queue(1, 0);
        let failed = queue.enqueue(DEFAULT_PRIORITY, async { Err::<(), _>("boom") });
        let explode = true;
        let panicked = queue.enqueue(DEFAULT_PRIORITY, async move {
            assert!(!explode, "task blew up");
            Ok::<(), String>(())
        });
        let ok = queue.enqueue(DEFAULT_PRIORITY, async { Ok::<(), String>(()) });

        assert_eq!(failed.wait().await, TaskOutcome::Failed("boom".into()));
        assert!(matches!(panicked.wait().await, TaskOutcome::Failed(_)));
        assert!(ok.wait().await.is_completed());
        queue.drain().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.status().failed, 2);
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let queue = queue(1, 0);
        queue.drain().await;
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_admission() {
        let queue = TaskQueue::new(
            "test",
            &QueueConfig {
                concurrency: 4,
                interval_ms: 100,
                interval_cap: 2,
                timeout_ms: 0,
            },
            Arc::new(EngineStats::new()),
        );
        let start = std::time::Instant::now();
        for _ in 0..4 {
            queue.enqueue(DEFAULT_PRIORITY, async { Ok::<(), String>(()) });
        }
        queue.drain().await;

        // Two admitted immediately, two after roughly one interval
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
