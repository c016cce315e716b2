//! In-memory priority task queue shared by all workers.
//!
//! Ready tasks live in a binary heap ordered by (priority, enqueue sequence),
//! so bands are served strictly by priority and FIFO within a band. Tasks
//! pushed back with a delay wait in a second heap keyed by their ready time
//! and are promoted lazily whenever a worker looks at the queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::task::{Priority, Task};

struct Ready {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // BinaryHeap is a max-heap: the most urgent, earliest task must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Delayed {
    ready_at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn insert(&mut self, task: Task, delay: Duration, now: Instant) {
        let seq = self.next_seq();
        if delay.is_zero() {
            self.ready.push(Ready {
                priority: task.priority,
                seq,
                task,
            });
        } else {
            self.delayed.push(Delayed {
                ready_at: now + delay,
                seq,
                task,
            });
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.ready_at <= now) {
            if let Some(d) = self.delayed.pop() {
                // Promotion takes a fresh sequence number: a retried task
                // queues behind work that was already waiting in its band.
                let seq = self.next_seq();
                self.ready.push(Ready {
                    priority: d.task.priority,
                    seq,
                    task: d.task,
                });
            }
        }
    }

    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// Bounded priority queue with delayed re-entry.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Task queue mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a new batch, all or nothing, respecting capacity.
    pub fn submit(&self, tasks: Vec<Task>) -> Result<(), AppError> {
        if tasks.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.len() + tasks.len() > self.capacity {
                return Err(AppError::QueueFull(self.capacity));
            }
            let now = Instant::now();
            for task in tasks {
                state.insert(task, Duration::ZERO, now);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Put a task back, optionally after a delay. Requeues ignore capacity so
    /// that in-flight work is never dropped.
    pub fn push(&self, task: Task, delay: Duration) {
        self.lock().insert(task, delay, Instant::now());
        self.notify.notify_waiters();
    }

    /// Non-blocking pop of the most urgent ready task.
    pub fn try_pop(&self) -> Option<Task> {
        let mut state = self.lock();
        state.promote_due(Instant::now());
        state.ready.pop().map(|r| r.task)
    }

    /// Wait for the next ready task. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Task> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a push in between is not missed.
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(ready) = state.ready.pop() {
                    return Some(ready.task);
                }
                state.delayed.peek().map(|d| d.ready_at)
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = &mut notified => {}
                () = sleep_until(next_deadline) => {}
            }
        }
    }

    /// Remove every queued task, ready or delayed.
    pub fn drain(&self) -> Vec<Task> {
        let mut state = self.lock();
        let mut out: Vec<Task> = state.ready.drain().map(|r| r.task).collect();
        out.extend(state.delayed.drain().map(|d| d.task));
        out
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn task(id: &str, priority: Priority) -> Task {
        Task::new(id, vec!["a".to_string()], priority)
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = TaskQueue::new(100);
        queue
            .submit(vec![
                task("low-1", Priority::Low),
                task("med-1", Priority::Medium),
                task("crit-1", Priority::Critical),
                task("med-2", Priority::Medium),
                task("low-2", Priority::Low),
                task("crit-2", Priority::Critical),
            ])
            .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|t| t.identifier)
            .collect();
        assert_eq!(
            order,
            vec!["crit-1", "crit-2", "med-1", "med-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_submit_respects_capacity() {
        let queue = TaskQueue::new(2);
        queue.submit(vec![task("a", Priority::Medium)]).unwrap();
        let err = queue
            .submit(vec![task("b", Priority::Medium), task("c", Priority::Medium)])
            .unwrap_err();
        assert!(matches!(err, AppError::QueueFull(2)));
        assert_eq!(queue.len(), 1);

        // Requeues are never refused.
        queue.push(task("d", Priority::Medium), Duration::ZERO);
        queue.push(task("e", Priority::Medium), Duration::ZERO);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_delayed_task_not_ready_early() {
        let queue = TaskQueue::new(10);
        queue.push(task("later", Priority::Critical), Duration::from_secs(60));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_delayed_task() {
        let queue = TaskQueue::new(10);
        let cancel = CancellationToken::new();
        queue.push(task("soon", Priority::Medium), Duration::from_millis(30));

        let started = Instant::now();
        let popped = queue.pop(&cancel).await.unwrap();
        assert_eq!(popped.identifier, "soon");
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task("x", Priority::Medium), Duration::ZERO);

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.unwrap().identifier, "x");
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_cancel() {
        let queue = Arc::new(TaskQueue::new(10));
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.pop(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());

        // No dequeues after cancellation even when work exists.
        queue.push(task("y", Priority::Medium), Duration::ZERO);
        assert!(queue.pop(&cancel).await.is_none());
    }

    #[test]
    fn test_drain_empties_both_heaps() {
        let queue = TaskQueue::new(10);
        queue.push(task("now", Priority::Medium), Duration::ZERO);
        queue.push(task("later", Priority::Medium), Duration::from_secs(60));
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
