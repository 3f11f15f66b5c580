use futures::TryStreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use indicatif::HumanBytes;
use reqwest::{header, Client, StatusCode};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::state::{Part, PartStatus};
use crate::utils::file_size;

pub const CHUNK_SIZE: usize = 128 * 1024;
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("transfer io failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

struct Throttle {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    burst: NonZeroU32,
}

impl Throttle {
    async fn wait_for(&self, len: usize) {
        let mut remaining = u32::try_from(len).unwrap_or(u32::MAX);
        while remaining > 0 {
            let step = remaining.min(self.burst.get());
            if let Some(n) = NonZeroU32::new(step) {
                if self.limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            remaining -= step;
        }
    }
}

/// Performs resumable single-connection transfers into one directory.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    download_dir: PathBuf,
    throttle: Option<Arc<Throttle>>,
}

impl Downloader {
    /// `rate_limit` is a global cap in bytes per second shared by every
    /// transfer running through this downloader (and its clones).
    pub fn new(download_dir: impl Into<PathBuf>, rate_limit: Option<NonZeroU32>) -> Self {
        // Only connecting is bounded; a stalled body read blocks the caller.
        let client = Client::builder()
            .user_agent(concat!("taskdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        let throttle = rate_limit.map(|limit| {
            Arc::new(Throttle {
                limiter: RateLimiter::direct(Quota::per_second(limit)),
                burst: limit,
            })
        });

        Self {
            client,
            download_dir: download_dir.into(),
            throttle,
        }
    }

    /// Fetches `part.url` into `download_dir/part.file_name`, resuming from
    /// the bytes already on disk. `on_progress` is called periodically while
    /// the body streams.
    pub async fn fetch<F>(&self, part: &mut Part, mut on_progress: F) -> Result<()>
    where
        F: FnMut(&Part),
    {
        let filepath = self.download_dir.join(&part.file_name);
        let mut offset = file_size(&filepath).await;

        let mut request = self.client.get(&part.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;

        let status = response.status();
        // A crash between the final fsync and the checkpoint leaves a
        // complete file behind; servers answer the resume with 416.
        if status == StatusCode::RANGE_NOT_SATISFIABLE
            && offset > 0
            && offset == part.bytes_total
        {
            debug!(url = %part.url, offset, "file already complete on disk");
            part.status = PartStatus::Downloading;
            part.bytes_done = offset;
            return Ok(());
        }
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::UnexpectedStatus(status));
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if offset > 0 && status == StatusCode::OK {
            debug!(url = %part.url, offset, "server ignored range request, restarting from zero");
            offset = 0;
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }

        if let Some(len) = response.content_length() {
            part.bytes_total = offset + len;
        }
        part.status = PartStatus::Downloading;
        part.bytes_done = offset;

        let mut file = options.open(&filepath).await?;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader = StreamReader::new(stream);
        tokio::pin!(reader);

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut last_report = Instant::now();
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(throttle) = &self.throttle {
                throttle.wait_for(n).await;
            }
            file.write_all(&buf[..n]).await?;
            part.bytes_done += n as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                on_progress(part);
                last_report = Instant::now();
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        info!(
            file = %part.file_name,
            size = %HumanBytes(part.bytes_done),
            resumed_from = offset,
            "part transfer finished"
        );
        Ok(())
    }
}
