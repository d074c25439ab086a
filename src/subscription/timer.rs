//! Shared timer pool for delayed executions.
//!
//! One scheduler thread waits for the earliest deadline and hands due tasks
//! to a small fixed set of worker threads, so idle subscriptions hold no
//! thread of their own.

use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send>;

/// How long shutdown waits for workers to finish their current task.
const WORKER_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Handle of a scheduled task, used to cancel it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Instant,
    seq: u64,
}

struct Queue {
    entries: BTreeMap<TimerKey, Task>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// Scheduler plus worker threads.
pub struct TimerPool {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Disconnects once every worker has exited.
    exited: Receiver<()>,
}

impl TimerPool {
    /// Start a pool with `workers` worker threads (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BTreeMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let (sender, receiver) = unbounded::<Task>();
        let (exit_guard, exited) = bounded::<()>(0);
        let mut handles = Vec::with_capacity(workers.max(1));

        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let guard = exit_guard.clone();
            let handle = thread::Builder::new()
                .name(format!("factstore-timer-{}", i))
                .spawn(move || {
                    run_worker(receiver);
                    drop(guard);
                })?;
            handles.push(handle);
        }
        drop(exit_guard);

        let scheduler_shared = Arc::clone(&shared);
        let scheduler = thread::Builder::new()
            .name("factstore-scheduler".into())
            .spawn(move || run_scheduler(scheduler_shared, sender))?;

        Ok(Self {
            shared,
            scheduler: Mutex::new(Some(scheduler)),
            workers: Mutex::new(handles),
            exited,
        })
    }

    /// Run `task` on a worker once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<TimerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(StoreError::InvalidOperation("timer pool is shut down".into()));
        }
        let key = TimerKey {
            deadline: Instant::now() + delay,
            seq: queue.next_seq,
        };
        queue.next_seq += 1;

        let earliest = queue.entries.keys().next().map_or(true, |first| key < *first);
        queue.entries.insert(key, Box::new(task));
        if earliest {
            self.shared.wakeup.notify_one();
        }
        Ok(key)
    }

    /// Remove a pending task, dropping it. Returns false if it already ran
    /// or was handed to a worker.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        self.shared.queue.lock().entries.remove(key).is_some()
    }

    /// Tasks waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    /// Stop all threads. Pending tasks are dropped without running.
    ///
    /// Workers finish the task they are running. One still busy after a
    /// short grace period, such as a follow pass blocked on a slow consumer,
    /// is detached instead of joined; it exits once that task returns.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.entries.clear();
        }
        self.shared.wakeup.notify_all();

        let current = thread::current().id();
        if let Some(handle) = self.scheduler.lock().take() {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!("timer scheduler panicked");
            }
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if workers.iter().any(|h| h.thread().id() == current) {
            return;
        }
        match self.exited.recv_timeout(WORKER_EXIT_GRACE) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                for handle in workers {
                    if handle.join().is_err() {
                        tracing::warn!("timer worker panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let busy = workers.iter().filter(|h| !h.is_finished()).count();
                tracing::warn!(busy, "timer workers still running tasks, detaching");
            }
        }
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(shared: Arc<Shared>, workers: Sender<Task>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }

        let now = Instant::now();
        let next = queue.entries.keys().next().copied();
        match next {
            Some(key) if key.deadline <= now => {
                if let Some(task) = queue.entries.remove(&key) {
                    if workers.send(task).is_err() {
                        break;
                    }
                }
            }
            Some(key) => {
                shared.wakeup.wait_until(&mut queue, key.deadline);
            }
            None => {
                shared.wakeup.wait(&mut queue);
            }
        }
    }
    tracing::debug!("timer scheduler stopped");
}

fn run_worker(tasks: Receiver<Task>) {
    for task in tasks.iter() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("timer task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let pool = TimerPool::new(1).unwrap();
        let (tx, rx) = unbounded();

        for (delay, label) in [(60, "late"), (10, "early"), (30, "middle")] {
            let tx = tx.clone();
            pool.schedule(Duration::from_millis(delay), move || {
                tx.send(label).unwrap();
            })
            .unwrap();
        }

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_cancel_prevents_execution() {
        let pool = TimerPool::new(2).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let key = pool
            .schedule(Duration::from_millis(50), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(pool.pending(), 1);
        assert!(pool.cancel(&key));
        assert!(!pool.cancel(&key));
        assert_eq!(pool.pending(), 0);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_refuses_new_tasks() {
        let pool = TimerPool::new(1).unwrap();
        pool.schedule(Duration::from_secs(60), || {}).unwrap();
        pool.shutdown();
        assert_eq!(pool.pending(), 0);
        assert!(pool.schedule(Duration::ZERO, || {}).is_err());
    }

    #[test]
    fn test_shutdown_does_not_wait_for_a_stuck_task() {
        let pool = TimerPool::new(2).unwrap();
        let (started_tx, started_rx) = unbounded();
        let (_hold, blocked) = unbounded::<()>();
        pool.schedule(Duration::ZERO, move || {
            started_tx.send(()).unwrap();
            let _ = blocked.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(pool.schedule(Duration::ZERO, || {}).is_err());
    }
}
