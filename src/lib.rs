pub mod asr;
pub mod audio;
pub mod config;
pub mod export;
pub mod schedule;
pub mod storage;
pub mod utils;
pub mod web;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use asr::{AsrEngine, AsrParams};
use config::AppConfig;
use schedule::{
    JobQueue, SchedulerConfig, SubmissionGateway, TaskManager, TaskScheduler, TranscribeProcessor,
};
use storage::task::{SqliteTaskStorage, TaskStorage};
use storage::upload::UploadDir;

pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub task_manager: Arc<TaskManager>,
    pub gateway: Arc<SubmissionGateway>,
}

/// Everything `main` needs: the shared context for the web layer and the
/// scheduler that owns the workers.
pub struct App {
    pub ctx: Arc<AppContext>,
    pub scheduler: Arc<TaskScheduler>,
}

/// Open storage, build the queue and wire gateway, manager and workers.
///
/// The recognizer is passed in so startup decides which model is loaded.
pub async fn bootstrap(config: AppConfig, asr: Arc<dyn AsrEngine>) -> Result<App> {
    ensure_database_dir(&config.database_url)?;

    let pool = storage::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let storage: Arc<dyn TaskStorage> = Arc::new(SqliteTaskStorage::new(pool.clone()).await?);
    let queue = Arc::new(JobQueue::new(pool, config.retry_policy(), config.lease_duration()).await?);
    let uploads = UploadDir::create(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let gateway = Arc::new(SubmissionGateway::new(
        storage.clone(),
        uploads.clone(),
        queue.clone(),
        config.max_upload_bytes,
    ));
    let task_manager = Arc::new(TaskManager::new(storage.clone(), uploads.clone(), queue.clone()));

    let mut params = AsrParams::new();
    params
        .set_language(Some(config.language.clone()))
        .set_initial_prompt(Some(config.initial_prompt.clone()));
    let processor = Arc::new(TranscribeProcessor::new(asr, storage, uploads, params));

    let scheduler = Arc::new(TaskScheduler::new(
        task_manager.clone(),
        queue,
        SchedulerConfig {
            poll_interval: config.poll_interval,
            time_limit: config.time_limit,
            sweep_interval: config.sweep_interval,
            orphan_grace: config.orphan_grace,
        },
    ));
    for _ in 0..config.workers {
        scheduler.spawn_worker(processor.clone()).await;
    }
    info!("Started {} worker(s)", config.workers);

    Ok(App {
        ctx: Arc::new(AppContext {
            config: Arc::new(config),
            task_manager,
            gateway,
        }),
        scheduler,
    })
}

/// 确保 SQLite 文件所在目录存在
fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(rest) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() || file == ":memory:" {
        return Ok(());
    }
    if let Some(dir) = Path::new(file).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create database directory {}", dir.display()))?;
    }
    Ok(())
}
