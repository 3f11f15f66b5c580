use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use indicatif::HumanBytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{info, warn};

use taskdl::manager::{Manager, ManagerConfig};
use taskdl::state::{PartStatus, Task};
use taskdl::storage::FileStorage;

use crate::cli::Args;

pub async fn serve(args: Args) -> Result<()> {
    let mut workers = args.workers;
    if workers == 0 {
        warn!("invalid worker count 0, forcing to 1");
        workers = 1;
    }

    fs::create_dir_all(&args.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", args.data_dir))?;
    fs::create_dir_all(&args.state_dir)
        .await
        .with_context(|| format!("Failed to create state directory {:?}", args.state_dir))?;

    let tasks_file = args.tasks_file();
    let storage = Arc::new(
        FileStorage::open(&tasks_file)
            .await
            .with_context(|| format!("Failed to open task store {:?}", tasks_file))?,
    );

    let config = ManagerConfig {
        download_dir: args.data_dir.clone(),
        workers,
        queue_capacity: args.queue_capacity,
        rate_limit: args.rate_limit,
    };
    let manager = Manager::new(storage, config);
    manager
        .restore_from_storage()
        .await
        .context("Failed to restore tasks")?;

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.addr))?;
    info!(addr = %args.addr, workers, "HTTP server listening");

    axum::serve(listener, taskdl::api::router(manager.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    manager
        .shutdown()
        .await
        .context("Failed to flush task store on shutdown")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

pub async fn list_tasks(tasks_file: PathBuf) -> Result<()> {
    if !tasks_file.exists() {
        println!("Task store '{:?}' does not exist.", tasks_file);
        println!("Tip: If you used a custom state directory, please specify it with --state-dir");
        return Ok(());
    }

    let storage = FileStorage::open(&tasks_file)
        .await
        .with_context(|| format!("Failed to open task store {:?}", tasks_file))?;
    let mut tasks = storage.list();
    if tasks.is_empty() {
        println!("No tasks found in '{:?}'.", tasks_file);
        return Ok(());
    }
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let finished = tasks.iter().filter(|t| t.is_done()).count();
    let downloaded: u64 = tasks.iter().map(Task::bytes_done).sum();
    let known: u64 = tasks.iter().map(Task::bytes_total).sum();
    println!(
        "Summary: Tasks: {}/{} | Downloaded: {} / {}",
        finished,
        tasks.len(),
        HumanBytes(downloaded),
        HumanBytes(known)
    );
    println!();

    println!(
        "{:<34} {:<17} {:<10} {:<8} {:<10} {:<12}",
        "ID", "Created", "Status", "Parts", "Progress", "Size"
    );
    println!(
        "{:-<34} {:-<17} {:-<10} {:-<8} {:-<10} {:-<12}",
        "", "", "", "", "", ""
    );
    for task in &tasks {
        let created = DateTime::from_timestamp(task.created_at, 0)
            .map(|d| d.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let parts_done = task
            .parts
            .iter()
            .filter(|p| p.status == PartStatus::Done)
            .count();
        let total = task.bytes_total();
        let progress = if total > 0 {
            (task.bytes_done() as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "{:<34} {:<17} {:<10} {:<8} {:<10} {:<12}",
            task.id,
            created,
            format!("{:?}", task.status).to_lowercase(),
            format!("{}/{}", parts_done, task.parts.len()),
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(total))
        );
        for part in task.parts.iter().filter(|p| p.error.is_some()) {
            println!(
                "    {} -> {}",
                part.file_name,
                part.error.as_deref().unwrap_or_default()
            );
        }
    }

    Ok(())
}
