use super::*;
use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};
use crate::storage::connect;
use crate::storage::task::{SqliteTaskStorage, StatusUpdate, StoreError, TaskStats, UpdateOutcome};
use crate::storage::upload::{storage_name, UploadDir};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

// 测试用的识别引擎
struct FakeAsr {
    calls: AtomicUsize,
    behavior: Behavior,
}

enum Behavior {
    Text(&'static str),
    Fail(&'static str),
    Sleep(Duration),
    Panic,
}

impl FakeAsr {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            behavior,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AsrEngine for FakeAsr {
    fn transcribe_file(&self, _path: &Path, _params: &AsrParams) -> Result<TranscribeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Text(text) => Ok(TranscribeResult::from_segments(vec![TranscribeSegment {
                text: text.to_string(),
                start: 0,
                end: 100,
            }])),
            Behavior::Fail(msg) => Err(anyhow::anyhow!("{}", msg)),
            Behavior::Sleep(d) => {
                std::thread::sleep(*d);
                Ok(TranscribeResult::from_segments(Vec::new()))
            }
            Behavior::Panic => panic!("model crashed"),
        }
    }
}

// 可按任务注入写入失败的存储
struct FlakyStorage {
    inner: Arc<dyn TaskStorage>,
    broken_updates: Mutex<HashSet<String>>,
    broken_deletes: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    fn new(inner: Arc<dyn TaskStorage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken_updates: Mutex::new(HashSet::new()),
            broken_deletes: Mutex::new(HashSet::new()),
        })
    }

    fn break_updates(&self, id: &str) {
        self.broken_updates.lock().unwrap().insert(id.to_string());
    }

    fn break_deletes(&self, id: &str) {
        self.broken_deletes.lock().unwrap().insert(id.to_string());
    }

    fn injected() -> StoreError {
        StoreError::Database(sea_orm::DbErr::Custom("disk I/O error".to_string()))
    }
}

#[async_trait]
impl TaskStorage for FlakyStorage {
    async fn create(&self, id: &str, filename: &str) -> Result<Task, StoreError> {
        self.inner.create(id, filename).await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list().await
    }

    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        self.inner.list_by_ids(ids).await
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<UpdateOutcome, StoreError> {
        if self.broken_updates.lock().unwrap().contains(id) {
            return Err(Self::injected());
        }
        self.inner.update_status(id, update).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        if self.broken_deletes.lock().unwrap().contains(id) {
            return Err(Self::injected());
        }
        self.inner.delete(id).await
    }

    async fn stats(&self) -> Result<TaskStats, StoreError> {
        self.inner.stats().await
    }
}

struct Harness {
    gateway: SubmissionGateway,
    manager: Arc<TaskManager>,
    queue: Arc<JobQueue>,
    storage: Arc<dyn TaskStorage>,
    uploads: UploadDir,
    worker: TaskWorker,
    // write failures injected here only reach the manager
    flaky: Arc<FlakyStorage>,
    _tmp: TempDir,
}

async fn setup(
    asr: Arc<dyn AsrEngine>,
    max_retries: u32,
    lease: Duration,
    time_limit: Duration,
) -> Result<Harness> {
    let tmp = tempfile::tempdir()?;
    let url = format!("sqlite://{}", tmp.path().join("storage.db").display());
    let pool = connect(&url).await?;

    let storage: Arc<dyn TaskStorage> = Arc::new(SqliteTaskStorage::new(pool.clone()).await?);
    let policy = RetryPolicy {
        max_retries,
        min_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    };
    let queue = Arc::new(JobQueue::new(pool, policy, lease).await?);
    let uploads = UploadDir::create(tmp.path().join("uploads")).await?;

    let gateway = SubmissionGateway::new(storage.clone(), uploads.clone(), queue.clone(), 8 * 1024 * 1024);
    let flaky = FlakyStorage::new(storage.clone());
    let manager = Arc::new(TaskManager::new(flaky.clone(), uploads.clone(), queue.clone()));
    let processor = Arc::new(TranscribeProcessor::new(
        asr,
        storage.clone(),
        uploads.clone(),
        AsrParams::new(),
    ));
    let worker = TaskWorker::new(queue.clone(), processor)
        .with_interval(Duration::from_millis(10))
        .with_time_limit(time_limit);

    Ok(Harness {
        gateway,
        manager,
        queue,
        storage,
        uploads,
        worker,
        flaky,
        _tmp: tmp,
    })
}

/// Drive the worker until nothing is queued or leased. Returns deliveries made.
async fn drain(h: &Harness) -> Result<usize> {
    let mut deliveries = 0;
    for _ in 0..500 {
        if h.worker.process_next().await? {
            deliveries += 1;
            continue;
        }
        let depth = h.queue.depth(TRANSCRIBE_QUEUE).await?;
        if depth.queued == 0 && depth.leased == 0 {
            return Ok(deliveries);
        }
        sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("queue did not drain")
}

fn two_megabytes() -> Vec<u8> {
    vec![0u8; 2 * 1024 * 1024]
}

#[tokio::test]
async fn test_complete_task_lifecycle() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("会议开始"));
    let h = setup(asr.clone(), 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let submitted = h
        .gateway
        .submit_bytes("a.wav", Some("audio/wav"), &two_megabytes())
        .await?;
    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    let path = h.uploads.path_for(&task.id, &task.filename);
    assert!(path.exists());

    assert_eq!(drain(&h).await?, 1);
    assert_eq!(asr.calls(), 1);

    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("会议开始"));
    assert!(task.completed_at.is_some());
    assert!(task.error.is_none());
    assert!(!path.exists());

    let depth = h.queue.depth(TRANSCRIBE_QUEUE).await?;
    assert_eq!(depth.queued + depth.leased + depth.dead, 0);
    Ok(())
}

#[tokio::test]
async fn test_failure_is_retried_until_dead() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Fail("model exploded"));
    let h = setup(asr.clone(), 2, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let submitted = h
        .gateway
        .submit_bytes("a.wav", Some("audio/wav"), b"RIFF")
        .await?;

    // max_retries + 1 deliveries in total
    assert_eq!(drain(&h).await?, 3);
    // the upload is removed after the first attempt, later ones find no file
    assert_eq!(asr.calls(), 1);

    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.result.is_none());
    assert!(task.completed_at.is_none());
    assert!(task.error.unwrap().starts_with("audio file not found"));

    assert_eq!(h.queue.depth(TRANSCRIBE_QUEUE).await?.dead, 1);
    assert!(h.uploads.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_task_is_dropped_without_retry() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr.clone(), 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let submitted = h
        .gateway
        .submit_bytes("a.wav", Some("audio/wav"), b"RIFF")
        .await?;
    // row vanishes while the job is still queued
    h.storage.delete(&submitted.task_id).await?;

    assert_eq!(drain(&h).await?, 1);
    assert_eq!(asr.calls(), 0);
    // acked and gone, not parked as dead
    let depth = h.queue.depth(TRANSCRIBE_QUEUE).await?;
    assert_eq!(depth.queued + depth.leased + depth.dead, 0);
    assert!(h.uploads.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_repeated_delivery_of_completed_task_is_acked() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("第一次"));
    let h = setup(asr.clone(), 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let submitted = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    assert_eq!(drain(&h).await?, 1);

    // same message again, as after a lost ack; the upload is already gone
    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    let again = TranscribeJob {
        task_id: task.id.clone(),
        file_name: storage_name(&task.id, &task.filename),
    };
    h.queue
        .enqueue(TRANSCRIBE_QUEUE, Some(task.id.as_str()), &again)
        .await?;

    assert_eq!(drain(&h).await?, 1);
    assert_eq!(asr.calls(), 1);

    let depth = h.queue.depth(TRANSCRIBE_QUEUE).await?;
    assert_eq!(depth.queued + depth.leased + depth.dead, 0);

    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("第一次"));
    assert!(task.error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_time_limit_fails_task_and_removes_upload() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Sleep(Duration::from_millis(500)));
    let h = setup(asr, 0, Duration::from_secs(60), Duration::from_millis(50)).await?;

    let submitted = h
        .gateway
        .submit_bytes("slow.wav", Some("audio/wav"), b"RIFF")
        .await?;

    assert!(h.worker.process_next().await?);

    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("time limit"));
    assert!(h.uploads.list().await?.is_empty());
    assert_eq!(h.queue.depth(TRANSCRIBE_QUEUE).await?.dead, 1);
    Ok(())
}

#[tokio::test]
async fn test_panicking_engine_does_not_kill_worker() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Panic);
    let h = setup(asr, 0, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let first = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let second = h.gateway.submit_bytes("b.wav", Some("audio/wav"), b"RIFF").await?;

    assert_eq!(drain(&h).await?, 2);
    for id in [&first.task_id, &second.task_id] {
        let task = h.manager.get_task(id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
    assert!(h.uploads.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lost_worker_on_final_attempt_is_reaped() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr, 0, Duration::from_millis(20), Duration::from_secs(10)).await?;

    let submitted = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    // a worker takes the job and dies without settling it
    let job = h.queue.lease(TRANSCRIBE_QUEUE).await?.unwrap();
    assert!(job.is_final_attempt());
    h.storage
        .update_status(&submitted.task_id, crate::storage::task::StatusUpdate::Processing)
        .await?;

    sleep(Duration::from_millis(40)).await;
    assert_eq!(h.manager.handle_expired_leases().await?, 1);

    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("lease expired"));
    assert!(h.uploads.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reaper_keeps_going_after_a_failed_write() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr, 0, Duration::from_millis(20), Duration::from_secs(10)).await?;

    let stuck = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let lost = h.gateway.submit_bytes("b.wav", Some("audio/wav"), b"RIFF").await?;
    for submitted in [&stuck, &lost] {
        h.queue.lease(TRANSCRIBE_QUEUE).await?.unwrap();
        h.storage
            .update_status(&submitted.task_id, StatusUpdate::Processing)
            .await?;
    }
    h.flaky.break_updates(&stuck.task_id);

    sleep(Duration::from_millis(40)).await;
    assert_eq!(h.manager.handle_expired_leases().await?, 1);

    let task = h.manager.get_task(&lost.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("lease expired"));

    let task = h.manager.get_task(&stuck.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    // only the task that was marked failed loses its upload
    let remaining = h.uploads.list().await?;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].name.starts_with(&stuck.task_id));
    assert_eq!(h.queue.depth(TRANSCRIBE_QUEUE).await?.dead, 2);
    Ok(())
}

#[tokio::test]
async fn test_expired_lease_with_attempts_left_is_redelivered() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("recovered"));
    let h = setup(asr, 1, Duration::from_millis(20), Duration::from_secs(10)).await?;

    let submitted = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let _abandoned = h.queue.lease(TRANSCRIBE_QUEUE).await?.unwrap();
    sleep(Duration::from_millis(40)).await;

    assert!(h.worker.process_next().await?);
    let task = h.manager.get_task(&submitted.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("recovered"));
    Ok(())
}

#[tokio::test]
async fn test_batch_delete_reports_unknown_ids() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr.clone(), 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let kept = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let doomed = h.gateway.submit_bytes("b.wav", Some("audio/wav"), b"RIFF").await?;

    let report = h
        .manager
        .delete_tasks(&[doomed.task_id.clone(), "missing".to_string()])
        .await?
        .unwrap();
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.failed_deletes.len(), 1);
    assert_eq!(report.failed_deletes[0].task_id, "missing");

    assert!(h.manager.get_task(&doomed.task_id).await?.is_none());
    assert!(h.manager.get_task(&kept.task_id).await?.is_some());
    assert_eq!(h.uploads.list().await?.len(), 1);

    // the deleted task's queued job was cancelled, only one delivery remains
    assert_eq!(drain(&h).await?, 1);
    assert_eq!(asr.calls(), 1);

    assert!(h.manager.delete_tasks(&["missing".to_string()]).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_failed_row_delete_leaves_task_runnable() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("保留"));
    let h = setup(asr.clone(), 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let kept = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let doomed = h.gateway.submit_bytes("b.wav", Some("audio/wav"), b"RIFF").await?;
    h.flaky.break_deletes(&kept.task_id);

    let report = h
        .manager
        .delete_tasks(&[kept.task_id.clone(), doomed.task_id.clone()])
        .await?
        .unwrap();
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.failed_deletes.len(), 1);
    assert_eq!(report.failed_deletes[0].task_id, kept.task_id);
    assert!(report.failed_deletes[0].error.contains("disk I/O error"));

    // the task that could not be deleted still has its upload and its job
    let task = h.manager.get_task(&kept.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(h.uploads.path_for(&task.id, &task.filename).exists());
    assert!(h.manager.get_task(&doomed.task_id).await?.is_none());

    assert_eq!(drain(&h).await?, 1);
    let task = h.manager.get_task(&kept.task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("保留"));
    assert!(h.uploads.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_orphan_sweep_spares_live_uploads() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr, 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    let live = h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    let stray = h.uploads.root().join("stray_upload.wav");
    std::fs::write(&stray, b"left over")?;

    assert_eq!(h.manager.sweep_orphans(Duration::ZERO).await?, 1);
    assert!(!stray.exists());

    let task = h.manager.get_task(&live.task_id).await?.unwrap();
    assert!(h.uploads.path_for(&task.id, &task.filename).exists());

    // young files survive a non-zero grace period
    std::fs::write(&stray, b"left over")?;
    assert_eq!(h.manager.sweep_orphans(Duration::from_secs(3600)).await?, 0);
    assert!(stray.exists());
    Ok(())
}

#[tokio::test]
async fn test_stats_cover_tasks_and_queue() -> Result<()> {
    let asr = FakeAsr::new(Behavior::Text("x"));
    let h = setup(asr, 3, Duration::from_secs(60), Duration::from_secs(10)).await?;

    h.gateway.submit_bytes("a.wav", Some("audio/wav"), b"RIFF").await?;
    h.gateway.submit_bytes("b.wav", Some("audio/wav"), b"RIFF").await?;
    assert!(h.worker.process_next().await?);

    let stats = h.manager.get_task_stats().await?;
    assert_eq!(stats.tasks.completed, 1);
    assert_eq!(stats.tasks.pending, 1);
    assert_eq!(stats.queue.queued, 1);
    Ok(())
}
