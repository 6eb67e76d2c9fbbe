//! Bounded-concurrency priority task queue
//!
//! Runs submitted futures with at most `concurrency` of them in flight.
//! When a slot frees, the pending task with the highest priority starts
//! next; equal priorities start in submission order. Outputs are collected
//! in completion order and read through [`QueueStream`].
//!
//! Tasks may submit further tasks into the same queue while they run.

use crate::{DhtError, Result};
use futures::future::{BoxFuture, FutureExt};
use futures::Stream;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

struct Pending<P, T> {
    priority: P,
    seq: u64,
    task: BoxFuture<'static, T>,
    settled: oneshot::Sender<Result<()>>,
}

impl<P: Ord, T> PartialEq for Pending<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P: Ord, T> Eq for Pending<P, T> {}

impl<P: Ord, T> PartialOrd for Pending<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Pending<P, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<P, T> {
    pending: BinaryHeap<Pending<P, T>>,
    active: usize,
    next_seq: u64,
    closed: bool,
    results: VecDeque<T>,
    waker: Option<Waker>,
}

impl<P, T> State<P, T> {
    fn is_idle(&self) -> bool {
        self.active == 0 && self.pending.is_empty()
    }
}

struct Shared<P, T> {
    name: String,
    concurrency: usize,
    signal: CancellationToken,
    /// Tripped when the queue is closed or dropped; stops the watcher
    closed: CancellationToken,
    state: Mutex<State<P, T>>,
}

impl<P, T> Drop for Shared<P, T> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Handle to a submitted task
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl TaskHandle {
    /// Wait until the task has run, or learn that it was discarded
    ///
    /// Resolves to [`DhtError::Canceled`] when the task never started.
    pub async fn settled(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(DhtError::Canceled))
    }
}

/// Bounded-concurrency priority executor
///
/// Cloning yields another handle to the same queue.
pub struct Queue<P, T> {
    shared: Arc<Shared<P, T>>,
}

impl<P, T> Clone for Queue<P, T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P, T> Queue<P, T>
where
    P: Ord + Send + 'static,
    T: Send + 'static,
{
    /// Create a queue that stops dequeuing once `signal` is cancelled
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(name: impl Into<String>, concurrency: usize, signal: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            concurrency: concurrency.max(1),
            signal,
            closed: CancellationToken::new(),
            state: Mutex::new(State {
                pending: BinaryHeap::new(),
                active: 0,
                next_seq: 0,
                closed: false,
                results: VecDeque::new(),
                waker: None,
            }),
        });

        Self::spawn_watcher(Arc::downgrade(&shared), &shared);
        Self { shared }
    }

    /// Discard pending tasks as soon as the signal fires, without waiting for a
    /// consumer to poll
    fn spawn_watcher(weak: Weak<Shared<P, T>>, shared: &Shared<P, T>) {
        let signal = shared.signal.clone();
        let closed = shared.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    if let Some(shared) = weak.upgrade() {
                        Queue { shared }.cancel_pending();
                    }
                }
                _ = closed.cancelled() => {}
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, State<P, T>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency
    }

    /// Number of tasks currently executing
    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Number of tasks waiting for a slot
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Schedule a task; higher `priority` runs sooner
    pub fn run<F>(&self, task: F, priority: P) -> TaskHandle
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (settled, rx) = oneshot::channel();
        let handle = TaskHandle { rx };

        let jobs = {
            let mut state = self.lock();
            if state.closed || self.shared.signal.is_cancelled() {
                drop(state);
                let _ = settled.send(Err(DhtError::Canceled));
                return handle;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Pending {
                priority,
                seq,
                task: task.boxed(),
                settled,
            });
            self.take_runnable(&mut state)
        };

        self.start(jobs);
        handle
    }

    /// Pop every task that fits in the free slots, marking them active
    fn take_runnable(&self, state: &mut State<P, T>) -> Vec<Pending<P, T>> {
        let mut jobs = Vec::new();
        if state.closed || self.shared.signal.is_cancelled() {
            return jobs;
        }
        while state.active < self.shared.concurrency {
            match state.pending.pop() {
                Some(job) => {
                    state.active += 1;
                    jobs.push(job);
                }
                None => break,
            }
        }
        jobs
    }

    fn start(&self, jobs: Vec<Pending<P, T>>) {
        for job in jobs {
            let queue = self.clone();
            tokio::spawn(async move {
                let Pending { task, settled, .. } = job;
                let output = AssertUnwindSafe(task).catch_unwind().await;
                if output.is_err() {
                    tracing::error!("Task in queue {} panicked", queue.name());
                }
                let _ = settled.send(Ok(()));
                queue.finish(output.ok());
            });
        }
    }

    fn finish(&self, output: Option<T>) {
        let (jobs, waker) = {
            let mut state = self.lock();
            state.active -= 1;
            if let Some(output) = output {
                state.results.push_back(output);
            }
            let jobs = self.take_runnable(&mut state);
            (jobs, state.waker.take())
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.start(jobs);
    }

    /// Fail every pending task with [`DhtError::Canceled`] and refuse new ones
    pub fn cancel_pending(&self) {
        let (drained, waker) = {
            let mut state = self.lock();
            state.closed = true;
            let drained: Vec<_> = state.pending.drain().collect();
            (drained, state.waker.take())
        };
        if !drained.is_empty() {
            tracing::debug!(
                "Queue {} discarded {} pending tasks",
                self.shared.name,
                drained.len()
            );
        }
        for job in drained {
            let _ = job.settled.send(Err(DhtError::Canceled));
        }
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Close the queue: pending tasks are discarded and new ones refused
    pub fn close(&self) {
        self.cancel_pending();
        self.shared.closed.cancel();
    }

    /// Lazily yield task outputs in completion order
    ///
    /// The stream ends once nothing is pending or running. If the signal fires
    /// first it yields a single [`DhtError::Canceled`] and ends. Dropping the
    /// stream closes the queue.
    pub fn into_stream(&self) -> QueueStream<P, T> {
        QueueStream {
            queue: self.clone(),
            cancelled: Box::pin(self.shared.signal.clone().cancelled_owned()),
            done: false,
        }
    }
}

/// Completion-ordered outputs of a [`Queue`]
pub struct QueueStream<P, T>
where
    P: Ord + Send + 'static,
    T: Send + 'static,
{
    queue: Queue<P, T>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl<P, T> Stream for QueueStream<P, T>
where
    P: Ord + Send + 'static,
    T: Send + 'static,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            this.queue.cancel_pending();
            return Poll::Ready(Some(Err(DhtError::Canceled)));
        }

        let mut state = this.queue.lock();
        if let Some(output) = state.results.pop_front() {
            return Poll::Ready(Some(Ok(output)));
        }
        if state.is_idle() {
            drop(state);
            this.done = true;
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<P, T> Drop for QueueStream<P, T>
where
    P: Ord + Send + 'static,
    T: Send + 'static,
{
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_runs_all_tasks() {
        let queue: Queue<u32, u32> = Queue::new("test", 2, CancellationToken::new());
        for i in 0..5 {
            queue.run(async move { i * 10 }, 0);
        }

        let mut results: Vec<u32> = queue.into_stream().map(|r| r.unwrap()).collect().await;
        results.sort();
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue: Queue<u32, u32> = Queue::new("test", 1, CancellationToken::new());
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single slot so the rest queue up
        let blocker = gate.clone();
        queue.run(
            async move {
                blocker.notified().await;
                0
            },
            0,
        );
        for (id, priority) in [(1, 1), (2, 5), (3, 5), (4, 3)] {
            let order = order.clone();
            queue.run(
                async move {
                    order.lock().unwrap().push(id);
                    id
                },
                priority,
            );
        }

        assert_eq!(queue.pending(), 4);
        gate.notify_one();
        let _: Vec<_> = queue.into_stream().collect().await;

        assert_eq!(*order.lock().unwrap(), vec![2, 3, 4, 1]);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let queue: Queue<u32, ()> = Queue::new("test", 3, CancellationToken::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue.run(
                async move {
                    let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, AtomicOrdering::SeqCst);
                },
                0,
            );
        }

        let results: Vec<_> = queue.into_stream().collect().await;
        assert_eq!(results.len(), 12);
        assert!(max_seen.load(AtomicOrdering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_tasks_can_enqueue_more_tasks() {
        let queue: Queue<u32, u32> = Queue::new("test", 2, CancellationToken::new());
        let inner = queue.clone();
        queue.run(
            async move {
                for i in 1..=3 {
                    inner.run(async move { i }, i);
                }
                0
            },
            0,
        );

        let mut results: Vec<u32> = queue.into_stream().map(|r| r.unwrap()).collect().await;
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_discards_pending_tasks() {
        let signal = CancellationToken::new();
        let queue: Queue<u32, u32> = Queue::new("test", 1, signal.clone());
        let invoked = Arc::new(AtomicUsize::new(0));

        queue.run(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                1
            },
            0,
        );
        let counter = invoked.clone();
        let pending = queue.run(
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                2
            },
            0,
        );

        signal.cancel();
        assert!(matches!(pending.settled().await, Err(DhtError::Canceled)));
        assert_eq!(invoked.load(AtomicOrdering::SeqCst), 0);

        // Submissions after cancellation fail straight away
        let late = queue.run(async { 3 }, 0);
        assert!(matches!(late.settled().await, Err(DhtError::Canceled)));

        let mut stream = queue.into_stream();
        assert!(matches!(stream.next().await, Some(Err(DhtError::Canceled))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_with_task_in_flight() {
        let signal = CancellationToken::new();
        let queue: Queue<u32, u32> = Queue::new("test", 1, signal.clone());
        queue.run(futures::future::pending(), 0);

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let mut stream = queue.into_stream();
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(Err(DhtError::Canceled))));
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_queue() {
        let queue: Queue<u32, u32> = Queue::new("test", 1, CancellationToken::new());
        queue.run(async { 1 }, 0);
        let stream = queue.into_stream();
        drop(stream);

        let refused = queue.run(async { 2 }, 0);
        assert!(matches!(refused.settled().await, Err(DhtError::Canceled)));
    }

    #[tokio::test]
    async fn test_panicking_task_still_settles() {
        let queue: Queue<u32, u32> = Queue::new("test", 1, CancellationToken::new());
        fn boom() -> u32 {
            panic!("boom")
        }
        queue.run(async { boom() }, 1);
        queue.run(async { 7 }, 0);

        let results: Vec<u32> = queue.into_stream().map(|r| r.unwrap()).collect().await;
        assert_eq!(results, vec![7]);
    }
}
