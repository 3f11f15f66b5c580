//! Resumable multi-part download manager.
//!
//! Tasks group one or more URLs. A fixed pool of workers pulls tasks from a
//! bounded queue and fetches each part with byte-range resume, checkpointing
//! task state to a JSON store so unfinished work is picked up again after a
//! restart.

pub mod allocator;
pub mod api;
pub mod downloader;
pub mod manager;
pub mod state;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_util;

pub use manager::{Manager, ManagerConfig, ManagerError};
pub use state::{Part, PartStatus, Task, TaskStatus};
pub use storage::{FileStorage, StorageError};
