mod task_manager;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::schedule::processors::TaskProcessor;
use crate::schedule::queue::JobQueue;
pub use task_manager::{DeleteReport, FailedDelete, ManagerError, ServiceStats, TaskManager};
pub use worker::TaskWorker;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub time_limit: Duration,
    pub sweep_interval: Duration,
    pub orphan_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            time_limit: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            orphan_grace: Duration::from_secs(3600),
        }
    }
}

pub struct TaskScheduler {
    task_manager: Arc<TaskManager>,
    queue: Arc<JobQueue>,
    config: SchedulerConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(task_manager: Arc<TaskManager>, queue: Arc<JobQueue>, config: SchedulerConfig) -> Self {
        Self {
            task_manager,
            queue,
            config,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub async fn spawn_worker(&self, processor: Arc<dyn TaskProcessor>) {
        let worker = TaskWorker::new(self.queue.clone(), processor)
            .with_interval(self.config.poll_interval)
            .with_time_limit(self.config.time_limit);
        let handle = tokio::spawn(async move {
            worker.run().await;
        });
        let mut workers = self.workers.lock().await;
        workers.push(handle);
        info!("Spawned worker #{}", workers.len());
    }

    /// Run housekeeping until all workers exit.
    pub async fn run(&self) -> Result<()> {
        let tm = self.task_manager.clone();
        let config = self.config.clone();
        let maintenance = tokio::spawn(async move {
            loop {
                run_maintenance(&tm, &config).await;
                tokio::time::sleep(config.sweep_interval).await;
            }
        });

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.await?;
        }
        maintenance.abort();
        Ok(())
    }
}

async fn run_maintenance(tm: &TaskManager, config: &SchedulerConfig) {
    match tm.handle_expired_leases().await {
        Ok(0) => {}
        Ok(n) => info!("Failed {} task(s) whose worker was lost", n),
        Err(e) => error!("Error handling expired leases: {}", e),
    }
    match tm.sweep_orphans(config.orphan_grace).await {
        Ok(0) => {}
        Ok(n) => info!("Removed {} orphaned upload(s)", n),
        Err(e) => error!("Error sweeping orphaned uploads: {}", e),
    }
}
