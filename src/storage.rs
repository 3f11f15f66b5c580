//! Durable task store backed by a single JSON file.
//!
//! Every durable write serializes the whole map and atomically replaces the
//! file (temp file, fsync, rename). Reads are served from memory.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::state::{Part, Task};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("state file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    tasks: RwLock<HashMap<String, Task>>,
    dirty: AtomicBool,
    // Serializes file replacement; always taken before `tasks`.
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Opens the store at `path`, loading existing tasks. A missing file
    /// yields an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tasks = match fs::read(&path).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => HashMap::new(),
            Ok(raw) => serde_json::from_slice::<HashMap<String, Task>>(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        info!(path = %path.display(), tasks = tasks.len(), "task store opened");

        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    /// Upserts `task` and persists the store.
    pub async fn put(&self, task: &Task) -> Result<()> {
        {
            let mut tasks = self.tasks.write();
            tasks.insert(task.id.clone(), task.clone());
            self.dirty.store(true, Ordering::Release);
        }
        self.flush().await
    }

    /// Stages live progress of one part in memory only. Persisted by the
    /// next `put` or `flush`.
    pub fn record_progress(&self, id: &str, index: usize, part: &Part) {
        let mut tasks = self.tasks.write();
        if let Some(slot) = tasks.get_mut(id).and_then(|t| t.parts.get_mut(index)) {
            slot.clone_from(part);
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        self.tasks.read().values().cloned().collect()
    }

    /// Writes the current state if anything changed since the last
    /// successful write.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let snapshot = {
            let tasks = self.tasks.read();
            if !self.dirty.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            let sorted: BTreeMap<&String, &Task> = tasks.iter().collect();
            serde_json::to_vec_pretty(&sorted)
        };

        let result = match snapshot {
            Ok(bytes) => self.replace_file(&bytes).await,
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    async fn replace_file(&self, bytes: &[u8]) -> Result<()> {
        let tmp = tmp_path(&self.path);
        if let Err(err) = write_synced(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        debug!(path = %self.path.display(), bytes = bytes.len(), "task store written");
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
