//! Database-backed job queue and its polling worker.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;

use crate::clause::Direction;
use crate::error::NebulaResult;
use crate::executor::Executor;
use crate::model::{Entity, Model};
use crate::record;
use crate::value::Value;

/// Row of the `jobs` table.
pub struct Job;

impl Model for Job {
    fn table_name() -> &'static str {
        "jobs"
    }
}

/// Row of the `failed_jobs` table.
pub struct FailedJob;

impl Model for FailedJob {
    fn table_name() -> &'static str {
        "failed_jobs"
    }
}

const CREATE_QUEUE_TABLES: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    class TEXT NOT NULL,
    payload TEXT,
    in_process INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    updated_at TEXT
);
CREATE TABLE IF NOT EXISTS failed_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    class TEXT NOT NULL,
    payload TEXT,
    error TEXT,
    created_at TEXT,
    updated_at TEXT
);";

/// Creates the `jobs` and `failed_jobs` tables. Returns `false` when they
/// already existed.
pub async fn install_queue_tables(executor: &Executor) -> NebulaResult<bool> {
    let existing = executor
        .table("sqlite_master")
        .where_eq("type", "table")
        .where_in("name", ["jobs", "failed_jobs"])
        .count()
        .await?;
    if existing == 2 {
        return Ok(false);
    }
    executor.execute_script(CREATE_QUEUE_TABLES).await?;
    Ok(true)
}

/// Queues a job for `class` with a JSON payload.
pub async fn dispatch(
    executor: &Executor,
    queue: &str,
    class: &str,
    payload: &serde_json::Value,
) -> NebulaResult<Entity> {
    let job = Job::create(
        executor,
        record! {
            "queue" => queue,
            "class" => class,
            "payload" => payload.to_string(),
            "in_process" => 0,
        },
    )
    .await?;
    tracing::info!(operation = "job_dispatch", queue, class, "nebula job");
    Ok(job)
}

pub type JobResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Runs one job class. Registered on a [`Worker`] by class name.
pub trait JobHandler: Send + Sync {
    fn handle<'a>(&'a self, job: &'a Entity) -> BoxFuture<'a, JobResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub failed: u64,
}

/// Polls one queue and runs its jobs one at a time.
pub struct Worker {
    executor: Executor,
    queue: String,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    idle_sleep: Duration,
    max_runtime: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(executor: Executor, queue: &str) -> Self {
        Self {
            executor,
            queue: queue.to_owned(),
            handlers: HashMap::new(),
            idle_sleep: Duration::from_secs(5),
            max_runtime: Duration::from_secs(2 * 60 * 60),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn register(mut self, class: &str, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(class.to_owned(), Arc::new(handler));
        self
    }

    pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    /// Shares an external stop flag, e.g. one set by a signal task.
    pub fn with_shutdown_flag(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Loops until the shutdown flag is set or the maximum runtime elapses.
    pub async fn run(&self) -> NebulaResult<WorkerReport> {
        let started = Instant::now();
        let mut report = WorkerReport::default();
        tracing::info!(operation = "worker_start", queue = %self.queue, "nebula worker");

        while !self.stopping(started) {
            match self.run_once().await? {
                Some(JobOutcome::Completed) => report.processed += 1,
                Some(JobOutcome::Failed) => {
                    report.processed += 1;
                    report.failed += 1;
                }
                None => self.sleep_idle(started).await,
            }
        }

        tracing::info!(
            operation = "worker_stop",
            queue = %self.queue,
            processed = report.processed,
            failed = report.failed,
            "nebula worker"
        );
        Ok(report)
    }

    /// Takes the newest pending job, if any, and runs it.
    pub async fn run_once(&self) -> NebulaResult<Option<JobOutcome>> {
        let next = Job::query(&self.executor)
            .where_eq("queue", self.queue.as_str())
            .where_eq("in_process", 0)
            .order_by("id", Direction::Desc)
            .first()
            .await?;
        let Some(mut job) = next else {
            return Ok(None);
        };

        job.set("in_process", 1);
        job.save(&self.executor).await?;

        let class = job
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let result = match self.handlers.get(&class) {
            Some(handler) => handler.handle(&job).await,
            None => Err(format!("no handler registered for job class `{}`", class).into()),
        };

        let outcome = match result {
            Ok(()) => {
                tracing::info!(operation = "job_done", class = %class, "nebula job");
                record_job_metrics(&self.queue, false);
                JobOutcome::Completed
            }
            Err(err) => {
                tracing::warn!(operation = "job_failed", class = %class, error = %err, "nebula job");
                record_job_metrics(&self.queue, true);
                FailedJob::create(
                    &self.executor,
                    record! {
                        "queue" => job.get("queue").cloned(),
                        "class" => class.as_str(),
                        "payload" => job.get("payload").cloned(),
                        "error" => err.to_string(),
                    },
                )
                .await?;
                JobOutcome::Failed
            }
        };
        job.delete(&self.executor).await?;
        Ok(Some(outcome))
    }

    fn stopping(&self, started: Instant) -> bool {
        self.shutdown.load(Ordering::SeqCst) || started.elapsed() >= self.max_runtime
    }

    async fn sleep_idle(&self, started: Instant) {
        let step = Duration::from_millis(100).min(self.idle_sleep);
        let deadline = Instant::now() + self.idle_sleep;
        while Instant::now() < deadline && !self.stopping(started) {
            tokio::time::sleep(step).await;
        }
    }
}

#[cfg(feature = "metrics")]
fn record_job_metrics(queue: &str, failed: bool) {
    let labels = [("queue", queue.to_owned())];
    metrics::counter!("nebula.jobs.processed", &labels).increment(1);
    if failed {
        metrics::counter!("nebula.jobs.failed", &labels).increment(1);
    }
}

#[cfg(not(feature = "metrics"))]
fn record_job_metrics(_queue: &str, _failed: bool) {}
