use clap::{Parser, ValueEnum};
use std::num::NonZeroU32;
use std::path::PathBuf;

use taskdl::manager::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable multi-part download service", long_about = None)]
pub struct Args {
    /// Directory for downloaded files
    #[arg(long = "data-dir", env = "DOWNLOADER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory for task state storage
    #[arg(long = "state-dir", env = "DOWNLOADER_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    /// HTTP listen address
    #[arg(long, env = "DOWNLOADER_ADDR", default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Number of download workers
    #[arg(short = 'w', long, env = "DOWNLOADER_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Maximum number of queued tasks before task creation waits
    #[arg(long = "queue-capacity", env = "DOWNLOADER_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long = "rate-limit", env = "DOWNLOADER_RATE_LIMIT")]
    pub rate_limit: Option<NonZeroU32>,

    /// List stored tasks and their status, then exit
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    pub fn tasks_file(&self) -> PathBuf {
        self.state_dir.join("tasks.json")
    }
}
