//! Fixed-size worker pool with per-thread execution contexts.
//!
//! Each worker runs its initializer once, on its own thread, to build the
//! context every task on that thread receives (for GPU work: a context bound to
//! the shared device). Contexts never leave their thread.

use crate::error::{PoolError, TaskError};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Identity handed to a worker's initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub index: usize,
    pub name: String,
}

type Job<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

struct Queue<C> {
    tasks: VecDeque<Job<C>>,
    stop: bool,
}

struct Shared<C> {
    queue: Mutex<Queue<C>>,
    condition: Condvar,
}

/// Completion handle for a task submitted with [`WorkerPool::enqueue`].
pub struct TaskHandle<R> {
    receiver: Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task has run.
    pub fn wait(self) -> Result<R, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, TaskError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TaskError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Cancelled),
        }
    }

    /// Returns the result if the task already finished.
    pub fn try_get(&self) -> Option<Result<R, TaskError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Cancelled)),
        }
    }
}

pub struct WorkerPool<C> {
    shared: Arc<Shared<C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl<C: 'static> WorkerPool<C> {
    /// Spawns `size` workers and waits until every initializer has finished.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoWorkers`] if `size` is zero,
    /// [`PoolError::WorkerInit`] if any initializer fails (the pool is shut down
    /// first) and [`PoolError::Spawn`] if a thread cannot be created.
    pub fn new<F, E>(size: usize, init: F) -> Result<Self, PoolError>
    where
        F: Fn(&WorkerInfo) -> Result<C, E> + Send + Sync + 'static,
        E: Display,
    {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            condition: Condvar::new(),
        });
        let init = Arc::new(init);
        let (ready_tx, ready_rx) = bounded::<Result<(), PoolError>>(size);

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(size)),
            size,
        };

        for index in 0..size {
            let info = WorkerInfo {
                index,
                name: format!("threadpool#{}", index),
            };
            let shared = pool.shared.clone();
            let init = init.clone();
            let ready = ready_tx.clone();

            let spawned = thread::Builder::new()
                .name(info.name.clone())
                .spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| init(&info)));
                    let mut context = match outcome {
                        Ok(Ok(context)) => context,
                        Ok(Err(err)) => {
                            let _ = ready.send(Err(PoolError::WorkerInit {
                                index,
                                reason: err.to_string(),
                            }));
                            return;
                        }
                        Err(payload) => {
                            let _ = ready.send(Err(PoolError::WorkerInit {
                                index,
                                reason: panic_message(payload.as_ref()),
                            }));
                            return;
                        }
                    };
                    let _ = ready.send(Ok(()));
                    drop(ready);

                    debug!("{} ready", info.name);
                    worker_loop(&shared, &mut context);
                });

            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(err) => {
                    pool.stop_workers();
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..size {
            let failure = match ready_rx.recv() {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(_) => PoolError::WorkerInit {
                    index: size,
                    reason: "worker exited during initialisation".to_string(),
                },
            };
            pool.stop_workers();
            return Err(failure);
        }

        Ok(pool)
    }

    /// Queues `task` for the next idle worker.
    ///
    /// Fails with [`PoolError::Stopped`] once [`stop_workers`](Self::stop_workers)
    /// has been called.
    pub fn enqueue<F, R>(&self, task: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job<C> = Box::new(move |context: &mut C| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(context)))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            let _ = tx.send(result);
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.stop {
                return Err(PoolError::Stopped);
            }
            queue.tasks.push_back(job);
        }
        self.shared.condition.notify_one();

        Ok(TaskHandle { receiver: rx })
    }
}

impl<C> WorkerPool<C> {
    /// Stops accepting work, lets queued tasks finish and joins every worker.
    /// Safe to call more than once.
    pub fn stop_workers(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
        }
        self.shared.condition.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!("{} panicked outside of a task", name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stop
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }
}

impl<C> Drop for WorkerPool<C> {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop<C>(shared: &Shared<C>, context: &mut C) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            while queue.tasks.is_empty() && !queue.stop {
                shared.condition.wait(&mut queue);
            }
            match queue.tasks.pop_front() {
                Some(job) => job,
                None => return,
            }
        };

        job(context);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain_pool(size: usize) -> WorkerPool<()> {
        WorkerPool::new(size, |_: &WorkerInfo| Ok::<_, String>(())).unwrap()
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = WorkerPool::new(0, |_: &WorkerInfo| Ok::<_, String>(()))
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::NoWorkers));
    }

    #[test]
    fn returns_task_results() {
        let pool = plain_pool(2);
        let handles: Vec<_> = (0..8).map(|i| pool.enqueue(move |_| i * i).unwrap()).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn initializer_runs_once_per_worker_on_its_thread() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let pool = WorkerPool::new(3, move |info: &WorkerInfo| {
            assert_eq!(thread::current().name(), Some(info.name.as_str()));
            seen.lock().push(info.index);
            Ok::<_, String>(info.index)
        })
        .unwrap();

        let mut indices = calls.lock().clone();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);

        let index = pool.enqueue(|ctx: &mut usize| *ctx).unwrap().wait().unwrap();
        assert!(index < 3);
    }

    #[test]
    fn context_persists_between_tasks() {
        let pool = WorkerPool::new(1, |_: &WorkerInfo| Ok::<u32, String>(0)).unwrap();
        for _ in 0..4 {
            pool.enqueue(|count: &mut u32| *count += 1).unwrap();
        }
        let total = pool.enqueue(|count: &mut u32| *count).unwrap().wait().unwrap();
        assert_eq!(total, 4);
    }

    #[test]
    fn single_worker_runs_fifo() {
        let pool = plain_pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let order = order.clone();
                pool.enqueue(move |_| order.lock().push(i)).unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_after_stop_fails_fast() {
        let pool = plain_pool(2);
        pool.stop_workers();
        pool.stop_workers();
        assert!(pool.is_stopped());
        assert!(matches!(pool.enqueue(|_| ()), Err(PoolError::Stopped)));
    }

    #[test]
    fn stop_drains_queued_tasks() {
        let pool = plain_pool(1);
        let done = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let done = done.clone();
                pool.enqueue(move |_| {
                    thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        pool.stop_workers();
        assert_eq!(done.load(Ordering::SeqCst), 5);
        for handle in handles {
            assert_eq!(handle.wait(), Ok(()));
        }
    }

    #[test]
    fn panicking_task_is_reported_and_worker_survives() {
        let pool = plain_pool(1);
        let failed = pool
            .enqueue(|_| -> u32 { panic!("shader exploded") })
            .unwrap()
            .wait();
        assert_eq!(failed, Err(TaskError::Panicked("shader exploded".to_string())));

        assert_eq!(pool.enqueue(|_| 7).unwrap().wait(), Ok(7));
    }

    #[test]
    fn failed_initializer_fails_construction() {
        let result = WorkerPool::new(2, |info: &WorkerInfo| {
            if info.index == 1 {
                Err("no shared context".to_string())
            } else {
                Ok(())
            }
        });
        match result {
            Err(PoolError::WorkerInit { index, reason }) => {
                assert_eq!(index, 1);
                assert_eq!(reason, "no shared context");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("pool should not start"),
        }
    }

    #[test]
    fn try_get_and_timeout() {
        let pool = plain_pool(1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let blocker = {
            let gate = gate.clone();
            pool.enqueue(move |_| {
                let (open, cv) = &*gate;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
            })
            .unwrap()
        };

        assert!(blocker.try_get().is_none());
        assert_eq!(
            blocker.wait_timeout(Duration::from_millis(20)),
            Err(TaskError::Timeout)
        );

        *gate.0.lock() = true;
        gate.1.notify_all();
        assert_eq!(blocker.wait_timeout(Duration::from_secs(5)), Ok(()));
    }
}
