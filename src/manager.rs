//! Task queue, worker pool and crash recovery.
//!
//! Tasks flow through one bounded FIFO queue consumed by a fixed number of
//! workers. Each worker drives a task's parts in order and checkpoints the
//! task to the store after every part outcome.

use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allocator::FileNameAllocator;
use crate::downloader::Downloader;
use crate::state::{Part, PartStatus, Task, TaskStatus};
use crate::storage::{FileStorage, StorageError};
use crate::utils::{get_filename_from_url, random_token};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("manager is shutting down")]
    Closed,
    #[error("tasks were already restored from storage")]
    AlreadyStarted,
    #[error("persisting task state failed: {0}")]
    Storage(#[from] StorageError),
    #[error("file name allocation failed: {0}")]
    Allocation(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub download_dir: PathBuf,
    /// With zero workers nothing drains the queue; recovery then queues at
    /// most `queue_capacity` tasks and leaves the rest in the store.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Global transfer cap in bytes per second.
    pub rate_limit: Option<NonZeroU32>,
}

impl ManagerConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rate_limit: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

struct Lifecycle {
    closing: bool,
    started: bool,
    queue_tx: Option<mpsc::Sender<Task>>,
}

struct Inner {
    storage: Arc<FileStorage>,
    allocator: FileNameAllocator,
    downloader: Downloader,
    workers: usize,
    lifecycle: Mutex<Lifecycle>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the queue and the worker pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    pub fn new(storage: Arc<FileStorage>, config: ManagerConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Inner {
            storage,
            allocator: FileNameAllocator::new(&config.download_dir),
            downloader: Downloader::new(&config.download_dir, config.rate_limit),
            workers: config.workers,
            lifecycle: Mutex::new(Lifecycle {
                closing: false,
                started: false,
                queue_tx: Some(queue_tx),
            }),
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            handles: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn storage(&self) -> &Arc<FileStorage> {
        &self.inner.storage
    }

    /// Persists a new task with one pending part per URL and queues it.
    /// Waits while the queue is full.
    pub async fn create_task(&self, urls: Vec<String>) -> Result<Task> {
        if urls.is_empty() {
            return Err(ManagerError::Validation("urls must not be empty".to_string()));
        }
        if let Some(pos) = urls.iter().position(|u| u.trim().is_empty()) {
            return Err(ManagerError::Validation(format!("url #{} is blank", pos + 1)));
        }
        if self.inner.lifecycle.lock().closing {
            return Err(ManagerError::Closed);
        }

        // Allocation probes the download directory.
        let inner = self.inner.clone();
        let parts = tokio::task::spawn_blocking(move || {
            urls.into_iter()
                .map(|url| {
                    let url = url.trim().to_string();
                    let file_name = inner.allocator.allocate(&get_filename_from_url(&url));
                    Part::pending(url, file_name)
                })
                .collect::<Vec<_>>()
        })
        .await?;
        let task = Task {
            id: random_token(),
            created_at: chrono::Utc::now().timestamp(),
            status: TaskStatus::Running,
            parts,
        };

        self.submit(task).await
    }

    /// Persists `task` and queues it. Once persisted the task is accepted
    /// even if shutdown closes the queue first; the next start recovers it.
    async fn submit(&self, task: Task) -> Result<Task> {
        self.inner.storage.put(&task).await?;
        match self.inner.enqueue(task.clone()).await {
            Ok(()) => info!(task = %task.id, parts = task.parts.len(), "task created"),
            Err(ManagerError::Closed) => {
                info!(task = %task.id, "task stored during shutdown, deferred to next start")
            }
            Err(err) => return Err(err),
        }
        Ok(task)
    }

    /// Requeues every unfinished task from the store and starts the
    /// workers. Must run once, before task creation traffic is served.
    pub async fn restore_from_storage(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.started {
                return Err(ManagerError::AlreadyStarted);
            }
            if lifecycle.closing {
                return Err(ManagerError::Closed);
            }
            lifecycle.started = true;
        }

        let mut stored = self.inner.storage.list();
        stored.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut unfinished = Vec::new();
        for mut task in stored {
            for part in &task.parts {
                self.inner.allocator.reserve(&part.file_name);
            }
            if task.is_done() {
                continue;
            }
            for part in task.parts.iter_mut() {
                if part.status == PartStatus::Downloading {
                    part.status = PartStatus::Pending;
                }
            }
            task.status = TaskStatus::Running;
            self.inner.storage.put(&task).await?;
            unfinished.push(task);
        }

        self.spawn_workers();

        let recovered = unfinished.len();
        for task in unfinished {
            if self.inner.workers > 0 {
                self.inner.enqueue(task).await?;
            } else if !self.inner.try_enqueue(task)? {
                debug!("queue full without workers, leaving remaining tasks in storage");
                break;
            }
        }
        info!(recovered, workers = self.inner.workers, "tasks restored from storage");
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut handles = self.inner.handles.lock();
        for worker_id in 0..self.inner.workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(run_worker(inner, worker_id)));
        }
    }

    /// Stops accepting tasks, waits for every worker to drain the queue and
    /// exit, then flushes the store.
    pub async fn shutdown(&self) -> Result<()> {
        let queue_tx = {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.closing = true;
            lifecycle.queue_tx.take()
        };
        drop(queue_tx);

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        info!(workers = handles.len(), "waiting for workers to finish");
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker terminated abnormally");
            }
        }

        self.inner.storage.flush().await?;
        info!("download manager stopped");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn try_dequeue(&self) -> Option<Task> {
        self.inner.queue_rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Inner {
    async fn enqueue(&self, task: Task) -> Result<()> {
        let queue_tx = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.closing {
                return Err(ManagerError::Closed);
            }
            lifecycle.queue_tx.clone().ok_or(ManagerError::Closed)?
        };
        queue_tx.send(task).await.map_err(|_| ManagerError::Closed)
    }

    /// Queues `task` without waiting; `false` when the queue is full.
    fn try_enqueue(&self, task: Task) -> Result<bool> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closing {
            return Err(ManagerError::Closed);
        }
        let queue_tx = lifecycle.queue_tx.as_ref().ok_or(ManagerError::Closed)?;
        match queue_tx.try_send(task) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(ManagerError::Closed),
        }
    }

    async fn next_task(&self) -> Option<Task> {
        self.queue_rx.lock().await.recv().await
    }

    /// One processing pass over every part that is not done yet.
    async fn process_task(&self, task: &mut Task) {
        for index in 0..task.parts.len() {
            if task.parts[index].status == PartStatus::Done {
                continue;
            }

            let storage = &self.storage;
            let task_id = task.id.clone();
            let part = &mut task.parts[index];
            let outcome = self
                .downloader
                .fetch(part, |progress| storage.record_progress(&task_id, index, progress))
                .await;

            match outcome {
                Ok(()) => {
                    part.status = PartStatus::Done;
                    part.error = None;
                }
                Err(err) => {
                    warn!(task = %task_id, file = %part.file_name, error = %err, "part transfer failed");
                    part.status = PartStatus::Error;
                    part.error = Some(err.to_string());
                }
            }
            self.checkpoint(task).await;
        }

        task.status = TaskStatus::derive(&task.parts);
        self.checkpoint(task).await;
        info!(task = %task.id, status = ?task.status, "task processed");
    }

    async fn checkpoint(&self, task: &Task) {
        // Dirty state stays pending in the store; the next write retries it.
        if let Err(err) = self.storage.put(task).await {
            warn!(task = %task.id, error = %err, "checkpoint failed");
        }
    }
}

async fn run_worker(inner: Arc<Inner>, worker_id: usize) {
    debug!(worker_id, "worker started");
    while let Some(mut task) = inner.next_task().await {
        debug!(worker_id, task = %task.id, "task dequeued");
        inner.process_task(&mut task).await;
    }
    debug!(worker_id, "worker exited");
}
