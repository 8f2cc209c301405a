use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU16, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use chrono::Utc;
use rand::random;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    eid::Eid,
    errors::AppError,
    storage::StorageManager,
    sync::SyncPipeline,
};

pub const TASK_QUEUE_FILE: &str = "task-queue.json";

/// Seconds a finished task stays visible in the dump.
const DONE_TASK_TTL: Duration = Duration::from_secs(10);

pub type Job = (Eid, Task);

pub fn now() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Error(String),
}

impl Status {
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: i64,
}

impl Default for QueueDump {
    fn default() -> Self {
        Self {
            queue: vec![],
            now: now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: Eid,
    pub task: Task,
    pub status: Status,
    #[serde(default)]
    pub attempt: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Eid,
    pub status: Status,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Task {
    /// import a catalog feed from disk
    ImportFeed { path: PathBuf },

    /// refresh the vector of one product, or fan out to every active product
    UpdateEmbedding {
        sku: Option<String>,
        #[serde(default)]
        force: bool,
    },

    /// delete vectors of products that are no longer active
    Reconcile,

    /// request to gracefully shutdown task queue
    Shutdown,
}

/// Anything that accepts background work.
pub trait JobSink: Send + Sync {
    fn enqueue(&self, task: Task) -> Result<Eid, AppError>;
}

/// Channel-fed job queue mirrored to `task-queue.json`.
///
/// Every job is written to the dump as `Pending` before it is dispatched, so
/// jobs interrupted by a crash are delivered again by `recover`.
pub struct TaskQueue {
    store: Arc<dyn StorageManager>,
    lock: Mutex<()>,
    tx: mpsc::Sender<Job>,
    /// jobs sent to the workers and not finished yet
    outstanding: AtomicUsize,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn StorageManager>) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(Self {
            store,
            lock: Mutex::new(()),
            tx,
            outstanding: AtomicUsize::new(0),
        });
        (queue, rx)
    }

    pub fn read_queue_dump(&self) -> QueueDump {
        if !self.store.exists(TASK_QUEUE_FILE) {
            return QueueDump::default();
        }

        match self.store.read(TASK_QUEUE_FILE) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(dump) => dump,
                Err(e) => {
                    log::error!("queue dump is malformed, starting empty: {e}");
                    QueueDump::default()
                }
            },
            Err(e) => {
                log::error!("failed to read queue dump: {e}");
                QueueDump::default()
            }
        }
    }

    fn write_queue_dump(&self, queue_dump: &QueueDump) -> Result<(), AppError> {
        let data = serde_json::to_vec_pretty(queue_dump).map_err(anyhow::Error::from)?;
        self.store.write(TASK_QUEUE_FILE, &data)?;
        Ok(())
    }

    /// Read-modify-write of the dump under the queue lock.
    fn update(&self, f: impl FnOnce(&mut QueueDump)) -> Result<(), AppError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut queue_dump = self.read_queue_dump();
        f(&mut queue_dump);
        queue_dump.now = now();
        self.write_queue_dump(&queue_dump)
    }

    fn update_logged(&self, id: &Eid, f: impl FnOnce(&mut QueueDump)) {
        if let Err(e) = self.update(f) {
            log::error!("task {id}: failed to update queue dump: {e}");
        }
    }

    fn save_task(&self, task: &Task) -> Result<Eid, AppError> {
        let id = Eid::new();
        let task_dump = TaskDump {
            id: id.clone(),
            task: task.clone(),
            status: Status::Pending,
            attempt: 0,
        };
        self.update(|dump| dump.queue.push(task_dump))?;
        Ok(id)
    }

    pub fn set_status(&self, id: &Eid, status: Status) {
        self.update_logged(id, |dump| {
            if let Some(task_dump) = dump.queue.iter_mut().find(|td| td.id == *id) {
                task_dump.status = status;
            }
        });
    }

    fn set_attempt(&self, id: &Eid, attempt: u8) {
        self.update_logged(id, |dump| {
            if let Some(task_dump) = dump.queue.iter_mut().find(|td| td.id == *id) {
                task_dump.attempt = attempt;
            }
        });
    }

    pub fn remove_task(&self, id: &Eid) {
        self.update_logged(id, |dump| dump.queue.retain(|td| td.id != *id));
    }

    pub fn get(&self, id: &Eid) -> Option<TaskDump> {
        self.read_queue_dump()
            .queue
            .into_iter()
            .find(|td| td.id == *id)
    }

    /// Redeliver jobs a previous process left pending or in progress.
    pub fn recover(&self) -> Result<usize, AppError> {
        let mut recovered = Vec::new();
        self.update(|dump| {
            // finished tasks whose delayed removal never ran
            dump.queue.retain(|td| td.status != Status::Done);
            for td in dump.queue.iter_mut() {
                if td.status.is_active() && td.task != Task::Shutdown {
                    td.status = Status::Pending;
                    recovered.push((td.id.clone(), td.task.clone()));
                }
            }
        })?;

        let count = recovered.len();
        for job in recovered {
            self.send(job)?;
        }
        if count > 0 {
            log::info!("recovered {count} interrupted tasks");
        }
        Ok(count)
    }

    fn send(&self, job: Job) -> Result<(), AppError> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            anyhow::anyhow!("task queue is not running").into()
        })
    }

    /// Mark one job finished. True when it was the last outstanding one.
    fn job_finished(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_or(false, |previous| previous == 1)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send((Eid::new(), Task::Shutdown));
    }

    /// No task is pending or in progress.
    pub fn is_idle(&self) -> bool {
        !self
            .read_queue_dump()
            .queue
            .iter()
            .any(|td| td.status.is_active())
    }

    /// Poll until idle. Returns false when `timeout` passed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100));
        }
        true
    }
}

impl JobSink for TaskQueue {
    fn enqueue(&self, task: Task) -> Result<Eid, AppError> {
        let id = self.save_task(&task)?;
        log::debug!("task {id}: queued {task:?}");
        self.send((id.clone(), task))?;
        Ok(id)
    }
}

pub fn throttle(counter: &AtomicU16, max_threads: u16) {
    while counter.load(Ordering::Relaxed) >= max_threads {
        sleep(Duration::from_millis(100));
    }
}

fn rand_jitter(base_ms: u64) -> u64 {
    random::<u64>() % (base_ms / 2).max(1)
}

/// `base * 2^(attempt - 1)` plus jitter of up to half the base.
pub fn backoff_ms(base_ms: u64, attempt: u8) -> u64 {
    base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1) as u32))
        + rand_jitter(base_ms)
}

pub fn start_queue(
    task_rx: mpsc::Receiver<Job>,
    queue: Arc<TaskQueue>,
    pipeline: Arc<SyncPipeline>,
    config: Arc<Config>,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));

    log::debug!("waiting for job");
    while let Ok((id, task)) = task_rx.recv() {
        // graceful shutdown
        if let Task::Shutdown = &task {
            log::info!(
                "task queue shutting down, waiting for {} running tasks",
                thread_ctr.load(Ordering::Relaxed)
            );
            while thread_ctr.load(Ordering::Relaxed) > 0 {
                sleep(Duration::from_millis(100));
            }
            return;
        };

        throttle(&thread_ctr, config.task_queue_max_threads);
        thread_ctr.fetch_add(1, Ordering::Relaxed);

        let task_handle = std::thread::spawn({
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let config = config.clone();
            let id = id.clone();
            move || run_job(&id, &task, &queue, &pipeline, &config)
        });

        // handle thread panics
        std::thread::spawn({
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let thread_counter = thread_ctr.clone();
            move || {
                if let Err(err) = task_handle.join() {
                    log::error!("task {id} panicked: {err:?}");
                    finish_job(&queue, &pipeline);
                    queue.set_status(&id, Status::Error("task panicked".to_string()));
                }
                thread_counter.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }
}

/// Vector writes are buffered by the index and persisted once the queue
/// runs out of work.
fn finish_job(queue: &TaskQueue, pipeline: &SyncPipeline) {
    if queue.job_finished() {
        if let Err(err) = pipeline.flush_index() {
            log::error!("failed to flush vector index: {err}");
        }
    }
}

fn run_job(id: &Eid, task: &Task, queue: &Arc<TaskQueue>, pipeline: &SyncPipeline, config: &Config) {
    queue.set_status(id, Status::InProgress);

    let max_retries = config.task_queue_max_retries;
    let mut attempt = 0u8;

    loop {
        match task.run(pipeline, queue.as_ref()) {
            Ok(()) => {
                finish_job(queue, pipeline);
                queue.set_status(id, Status::Done);
                break;
            }
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay_ms = backoff_ms(config.task_queue_retry_base_ms, attempt);
                log::info!(
                    "task {id}: retrying (attempt {attempt}/{max_retries}) after error: {err}, backoff {delay_ms}ms"
                );
                queue.set_attempt(id, attempt);
                queue.set_status(id, Status::Pending);
                sleep(Duration::from_millis(delay_ms));
                queue.set_status(id, Status::InProgress);
            }
            Err(err) => {
                // failed tasks stay in the dump for inspection
                log::error!("task {id}: {task:?} failed after {attempt} retries: {err}");
                finish_job(queue, pipeline);
                queue.set_status(id, Status::Error(err.to_string()));
                return;
            }
        }
    }

    // remove task a bit later to give client an opportunity to react
    let queue = queue.clone();
    let id = id.clone();
    std::thread::spawn(move || {
        sleep(DONE_TASK_TTL);
        queue.remove_task(&id);
    });
}

impl Task {
    pub fn run(&self, pipeline: &SyncPipeline, sink: &dyn JobSink) -> Result<(), AppError> {
        match self {
            Task::ImportFeed { path } => {
                let report = pipeline.import_file(path, sink)?;
                if !report.unresolved_categories.is_empty() {
                    log::warn!(
                        "import {}: unresolved categories {:?}",
                        path.display(),
                        report.unresolved_categories
                    );
                }
                Ok(())
            }
            Task::UpdateEmbedding { sku: Some(sku), force } => {
                pipeline.update_embedding(sku, *force)?;
                Ok(())
            }
            Task::UpdateEmbedding { sku: None, .. } => {
                pipeline.queue_all_embeddings(sink)?;
                Ok(())
            }
            Task::Reconcile => {
                let report = pipeline.reconcile()?;
                if !report.failed.is_empty() {
                    return Err(AppError::VectorIndexUnavailable(format!(
                        "failed to delete {} vectors: {}",
                        report.failed.len(),
                        report.failed.join(", ")
                    )));
                }
                Ok(())
            }
            Task::Shutdown => Ok(()),
        }
    }
}
