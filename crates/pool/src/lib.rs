//! Pool of long-lived worker threads for user-code execution: collation
//! and preprocessing run here rather than on the async reactor, so a
//! panicking or slow preprocessor cannot stall batch delivery. Workers
//! share one work queue; completion and failure are routed back to the
//! submitter by work id.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

mod memory;
pub use memory::SharedBuffers;

/// How often idle workers poll the queue and the kill switch.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A failed unit of work: either an error returned by the task, a panic
/// captured with its payload, or a synthetic abort at shutdown.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct WorkError {
    pub message: String,
    pub stack: Option<String>,
    pub aborted: bool,
}

impl WorkError {
    fn aborted() -> Self {
        WorkError {
            message: "Aborted".to_string(),
            stack: None,
            aborted: true,
        }
    }
}

pub type Outcome = Result<Box<dyn Any + Send>, WorkError>;

pub struct ResultItem {
    pub work_id: String,
    pub outcome: Outcome,
}

impl ResultItem {
    /// Recover the task's typed result.
    pub fn downcast<T: 'static>(self) -> Result<T, WorkError> {
        let boxed = self.outcome?;
        boxed.downcast::<T>().map(|v| *v).map_err(|_| WorkError {
            message: "task returned an unexpected type".to_string(),
            stack: None,
            aborted: false,
        })
    }
}

type Task = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Any + Send>> + Send>;
type Callback = Box<dyn FnOnce(ResultItem) + Send>;

struct WorkItem {
    work_id: String,
    task: Task,
}

struct Shared {
    work_rx: Mutex<mpsc::Receiver<WorkItem>>,
    result_tx: Mutex<Option<mpsc::Sender<ResultItem>>>,
    callbacks: Mutex<HashMap<String, Callback>>,
    kill_switch: CancellationToken,
    shutting_down: AtomicBool,
}

/// The background worker pool. One instance per process, shared by all
/// iterations' prefetchers.
pub struct WorkerPool {
    work_tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<std::thread::JoinHandle<()>>>>,
    manager: Mutex<Option<std::thread::JoinHandle<()>>>,
    supervisor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.kill_switch.is_cancelled() {
            return;
        }
        let item = {
            let rx = shared.work_rx.lock().unwrap();
            rx.recv_timeout(POLL_INTERVAL)
        };
        let item = match item {
            Ok(item) => item,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(item.task)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(WorkError {
                message: err.to_string(),
                stack: Some(format!("{err:?}")),
                aborted: false,
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                Err(WorkError {
                    message,
                    stack: None,
                    aborted: false,
                })
            }
        };

        let result_tx = shared.result_tx.lock().unwrap().clone();
        if let Some(tx) = result_tx {
            let _ = tx.send(ResultItem {
                work_id: item.work_id,
                outcome,
            });
        }
    }
}

fn manager_loop(shared: Arc<Shared>, result_rx: mpsc::Receiver<ResultItem>) {
    while let Ok(result) = result_rx.recv() {
        let callback = shared.callbacks.lock().unwrap().remove(&result.work_id);
        match callback {
            Some(callback) => callback(result),
            None => {
                tracing::debug!(work_id = result.work_id, "dropping unclaimed work result")
            }
        }
    }
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
        let (result_tx, result_rx) = mpsc::channel::<ResultItem>();

        let shared = Arc::new(Shared {
            work_rx: Mutex::new(work_rx),
            result_tx: Mutex::new(Some(result_tx)),
            callbacks: Mutex::new(HashMap::new()),
            kill_switch: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        });

        tracing::debug!(num_workers, "starting background worker pool");

        let workers = Arc::new(Mutex::new(
            (0..num_workers)
                .map(|i| {
                    let shared = shared.clone();
                    std::thread::Builder::new()
                        .name(format!("pool-worker-{i}"))
                        .spawn(move || worker_loop(shared))
                        .expect("failed to spawn pool worker")
                })
                .collect::<Vec<_>>(),
        ));

        let manager = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("pool-manager".to_string())
                .spawn(move || manager_loop(shared, result_rx))
                .expect("failed to spawn pool manager")
        };

        // The supervisor respawns any worker that dies outside shutdown,
        // e.g. after an aborting panic in foreign code.
        let supervisor = {
            let shared = shared.clone();
            let workers = workers.clone();
            std::thread::Builder::new()
                .name("pool-supervisor".to_string())
                .spawn(move || loop {
                    if shared.kill_switch.is_cancelled() {
                        return;
                    }
                    std::thread::sleep(POLL_INTERVAL * 10);
                    if shared.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    let mut workers = workers.lock().unwrap();
                    for slot in workers.iter_mut() {
                        if slot.is_finished() {
                            tracing::warn!("pool worker died unexpectedly, respawning");
                            let shared = shared.clone();
                            let fresh = std::thread::Builder::new()
                                .name("pool-worker-respawn".to_string())
                                .spawn(move || worker_loop(shared))
                                .expect("failed to respawn pool worker");
                            let dead = std::mem::replace(slot, fresh);
                            let _ = dead.join();
                        }
                    }
                })
                .expect("failed to spawn pool supervisor")
        };

        WorkerPool {
            work_tx: Mutex::new(Some(work_tx)),
            shared,
            workers,
            manager: Mutex::new(Some(manager)),
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Enqueue a task and register a completion callback for its work id.
    pub fn submit(
        &self,
        task: impl FnOnce() -> anyhow::Result<Box<dyn Any + Send>> + Send + 'static,
        callback: impl FnOnce(ResultItem) + Send + 'static,
    ) -> String {
        let work_id = uuid::Uuid::new_v4().to_string();
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .insert(work_id.clone(), Box::new(callback));

        let tx = self.work_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx
                    .send(WorkItem {
                        work_id: work_id.clone(),
                        task: Box::new(task),
                    })
                    .is_err()
                {
                    self.abort_pending(&work_id);
                }
            }
            None => self.abort_pending(&work_id),
        }
        work_id
    }

    /// Enqueue a task and await its typed result.
    pub async fn run<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
    ) -> Result<T, WorkError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(
            move || task().map(|v| Box::new(v) as Box<dyn Any + Send>),
            move |result| {
                let _ = tx.send(result);
            },
        );
        match rx.await {
            Ok(result) => result.downcast::<T>(),
            Err(_) => Err(WorkError::aborted()),
        }
    }

    fn abort_pending(&self, work_id: &str) {
        if let Some(callback) = self.shared.callbacks.lock().unwrap().remove(work_id) {
            callback(ResultItem {
                work_id: work_id.to_string(),
                outcome: Err(WorkError::aborted()),
            });
        }
    }

    /// Trip the kill switch and stop all workers. Tasks still queued or
    /// whose results were not yet delivered resolve to `Aborted`.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.kill_switch.cancel();
        self.work_tx.lock().unwrap().take();

        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            let _ = supervisor.join();
        }
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }

        // Closing the result channel lets the manager drain and exit.
        self.shared.result_tx.lock().unwrap().take();
        if let Some(manager) = self.manager.lock().unwrap().take() {
            let _ = manager.join();
        }

        let callbacks: Vec<(String, Callback)> =
            self.shared.callbacks.lock().unwrap().drain().collect();
        for (work_id, callback) in callbacks {
            callback(ResultItem {
                work_id,
                outcome: Err(WorkError::aborted()),
            });
        }
        tracing::debug!("worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_tasks_and_returns_results() {
        let pool = WorkerPool::new(2);

        let out = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(out, 42);

        let results = futures::future::join_all(
            (0..16).map(|i| pool.run(move || Ok(i * i))),
        )
        .await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i * i);
        }
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_task_errors_are_delivered() {
        let pool = WorkerPool::new(1);

        let err = pool
            .run::<()>(|| anyhow::bail!("preprocessor exploded"))
            .await
            .unwrap_err();
        assert!(err.message.contains("preprocessor exploded"));
        assert!(!err.aborted);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_panics_do_not_kill_the_pool() {
        let pool = WorkerPool::new(1);

        let err = pool.run::<()>(|| panic!("boom")).await.unwrap_err();
        assert!(err.message.contains("boom"));

        // The same worker keeps serving.
        let out = pool.run(|| Ok(7)).await.unwrap();
        assert_eq!(out, 7);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_unclaimed_work() {
        let pool = WorkerPool::new(1);

        // Occupy the single worker, then queue another task behind it.
        let slow = pool.run(|| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(1)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = pool.run(|| Ok(2));
        let (slow, queued) = tokio::join!(
            slow,
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.shutdown();
                queued.await
            }
        );
        // The running task completes; the queued one may complete or abort
        // depending on whether the worker dequeued it before the switch.
        assert_eq!(slow.unwrap(), 1);
        if let Err(err) = queued {
            assert!(err.aborted);
        }
    }
}
