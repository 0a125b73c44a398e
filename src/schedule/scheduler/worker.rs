use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use crate::schedule::processors::{JobError, TaskProcessor};
use crate::schedule::queue::{Job, JobQueue, NackOutcome, QueueError};

pub struct TaskWorker {
    queue: Arc<JobQueue>,
    processor: Arc<dyn TaskProcessor>,
    // wait between empty polls when no wakeup arrives
    interval: Duration,
    // hard limit on a single delivery
    time_limit: Duration,
}

impl TaskWorker {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            queue,
            processor,
            interval: Duration::from_secs(1),
            time_limit: Duration::from_secs(3600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub async fn run(&self) {
        loop {
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => self.queue.wait_for_work(self.interval).await,
                Err(e) => {
                    error!("Error processing job: {}", e);
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Lease and settle one message. Returns false when the queue was empty.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let job = match self.queue.lease(self.processor.queue()).await? {
            Some(job) => job,
            None => return Ok(false),
        };

        let result = self.execute(&job).await;
        self.settle(&job, result).await?;
        Ok(true)
    }

    /// Run the handler on its own task so a panic or the time limit cannot
    /// take the worker down with it.
    async fn execute(&self, job: &Job) -> Result<(), JobError> {
        let processor = self.processor.clone();
        let delivery = job.clone();
        let mut handle = tokio::spawn(async move { processor.process(&delivery).await });

        let failure = match timeout(self.time_limit, &mut handle).await {
            Ok(Ok(result)) => return result,
            Ok(Err(join_err)) => JobError::Panicked(join_err.to_string()),
            Err(_) => {
                handle.abort();
                // wait for the aborted handler to drop its state
                let _ = handle.await;
                JobError::TimedOut(self.time_limit)
            }
        };

        warn!("Job {} did not finish: {}", job.id, failure);
        match self.processor.abandon(job, &failure).await {
            Ok(()) => Err(failure),
            Err(abandon_err @ JobError::TaskNotFound(_)) => Err(abandon_err),
            Err(abandon_err) => {
                error!("Failed to record failure of job {}: {}", job.id, abandon_err);
                Err(failure)
            }
        }
    }

    async fn settle(&self, job: &Job, result: Result<(), JobError>) -> Result<(), QueueError> {
        let err = match result {
            Ok(()) => {
                self.queue.ack(job).await?;
                return Ok(());
            }
            Err(err) => err,
        };

        if let JobError::TaskNotFound(task_id) = &err {
            error!(
                target: "consistency",
                "Job {} references missing task {}, acking and dropping message",
                job.id,
                task_id
            );
            self.queue.ack(job).await?;
            return Ok(());
        }

        let message = err.to_string();
        match self.queue.nack(job, &message, err.is_retryable()).await? {
            NackOutcome::Retry { delay } => info!(
                "Job {} failed on attempt {}/{}, retrying in {:?}: {}",
                job.id,
                job.attempts,
                job.max_retries + 1,
                delay,
                message
            ),
            NackOutcome::Dead => error!(
                "Job {} moved to dead letters after {} attempt(s): {}",
                job.id, job.attempts, message
            ),
            NackOutcome::Stale => warn!(
                "Job {} lease was lost before it could be settled",
                job.id
            ),
        }
        Ok(())
    }
}
