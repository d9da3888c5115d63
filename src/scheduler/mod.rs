//! Background pipeline job scheduler.
//!
//! At most one job may be `queued` or `running` at any instant,
//! process-wide. Jobs persist in the state database; any live rows found
//! at startup belong to a dead process and are reaped as failed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::{utc_now, Database};
use crate::pipeline::{log::tail_file, JobLog, PipelineRunSpec, PipelineRunner};
use crate::types::{JobId, JobStatus, Result, RuntimeError};

/// Executes one pipeline run; the seam lets tests schedule slow or
/// failing runners.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, novel_id: &str, spec: &PipelineRunSpec, log: &JobLog) -> Result<Value>;
}

#[async_trait]
impl JobRunner for PipelineRunner {
    async fn run(&self, novel_id: &str, spec: &PipelineRunSpec, log: &JobLog) -> Result<Value> {
        PipelineRunner::run(self, novel_id, spec, log).await
    }
}

/// Persistent job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub job_id: String,
    pub novel_id: String,
    pub owner_user_id: String,
    pub spec: PipelineRunSpec,
    pub status: JobStatus,
    pub current_step: Option<u32>,
    pub progress: f64,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    pub log_path: String,
    pub error: String,
    pub result: Value,
}

impl PipelineJob {
    fn new(novel_id: &str, owner_user_id: &str, spec: PipelineRunSpec, log_dir: &Path) -> Self {
        let job_id = JobId::new().to_string();
        let log_path = log_dir.join(format!("job_{job_id}.log"));
        Self {
            job_id,
            novel_id: novel_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            spec,
            status: JobStatus::Queued,
            current_step: None,
            progress: 0.0,
            created_at: utc_now(),
            started_at: String::new(),
            finished_at: String::new(),
            log_path: log_path.to_string_lossy().into_owned(),
            error: String::new(),
            result: Value::Object(Default::default()),
        }
    }
}

/// Invoked after every persisted status change.
pub type JobUpdateCallback = Arc<dyn Fn(&PipelineJob) + Send + Sync>;

/// Single-worker scheduler over the state database.
pub struct PipelineJobsService {
    db: Database,
    runner: Arc<dyn JobRunner>,
    on_update: Mutex<Option<JobUpdateCallback>>,
    current_job: Arc<Mutex<Option<String>>>,
}

impl PipelineJobsService {
    pub fn new(db: Database, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            db,
            runner,
            on_update: Mutex::new(None),
            current_job: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the status-change callback (novel bookkeeping and
    /// retrieval-cache invalidation live behind it).
    pub fn set_on_update(&self, callback: JobUpdateCallback) {
        *self.on_update.lock() = Some(callback);
    }

    /// Fail any job left `queued`/`running` by a previous process.
    pub fn reap_orphans(&self) -> Result<usize> {
        let conn = self.db.connect()?;
        let reaped = conn.execute(
            "UPDATE pipeline_jobs SET status = 'failed', error = 'aborted', finished_at = ?1
             WHERE status IN ('queued', 'running')",
            [utc_now()],
        )?;
        if reaped > 0 {
            tracing::warn!(reaped, "reaped orphaned pipeline jobs at startup");
        }
        Ok(reaped)
    }

    fn save(&self, job: &PipelineJob) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO pipeline_jobs
               (id, novel_id, owner_user_id, spec, status, current_step, progress,
                started_at, finished_at, created_at, log_path, error, result)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               current_step = excluded.current_step,
               progress = excluded.progress,
               started_at = excluded.started_at,
               finished_at = excluded.finished_at,
               error = excluded.error,
               result = excluded.result",
            (
                &job.job_id,
                &job.novel_id,
                &job.owner_user_id,
                serde_json::to_string(&job.spec)?,
                job.status.as_str(),
                job.current_step,
                job.progress,
                &job.started_at,
                &job.finished_at,
                &job.created_at,
                &job.log_path,
                &job.error,
                job.result.to_string(),
            ),
        )?;
        drop(conn);

        let callback = self.on_update.lock().clone();
        if let Some(callback) = callback {
            callback(job);
        }
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<PipelineJob> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT * FROM pipeline_jobs WHERE id = ?1",
            [job_id],
            Self::row_to_job,
        )
        .optional()?
        .ok_or_else(|| RuntimeError::NotFound(format!("job not found: {job_id}")))
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineJob> {
        let spec: String = row.get("spec")?;
        let status: String = row.get("status")?;
        let result: String = row.get("result")?;
        Ok(PipelineJob {
            job_id: row.get("id")?,
            novel_id: row.get("novel_id")?,
            owner_user_id: row.get("owner_user_id")?,
            spec: serde_json::from_str(&spec).unwrap_or_default(),
            status: JobStatus::from_str(&status).unwrap_or(JobStatus::Failed),
            current_step: row.get("current_step")?,
            progress: row.get("progress")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            log_path: row.get("log_path")?,
            error: row.get("error")?,
            result: serde_json::from_str(&result).unwrap_or(Value::Object(Default::default())),
        })
    }

    fn live_job_exists(&self) -> Result<bool> {
        let conn = self.db.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_jobs WHERE status IN ('queued', 'running')",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Start a job for one novel; its log lands in `log_dir` as
    /// `job_{id}.log`. Fails with `JobBusy` while another job is live
    /// anywhere in the process.
    pub fn start(
        self: &Arc<Self>,
        novel_id: &str,
        owner_user_id: &str,
        spec: PipelineRunSpec,
        log_dir: &Path,
    ) -> Result<PipelineJob> {
        spec.validate()?;
        let novel_id = novel_id.trim();
        if novel_id.is_empty() {
            return Err(RuntimeError::invalid("novel_id", "is empty"));
        }

        let job = {
            let mut current = self.current_job.lock();
            if current.is_some() || self.live_job_exists()? {
                return Err(RuntimeError::JobBusy);
            }

            let job = PipelineJob::new(novel_id, owner_user_id, spec, log_dir);
            self.save(&job)?;
            *current = Some(job.job_id.clone());
            job
        };

        let service = Arc::clone(self);
        let worker_job = job.clone();
        tokio::spawn(async move {
            service.run_job(worker_job).await;
        });

        Ok(job)
    }

    async fn run_job(&self, mut job: PipelineJob) {
        job.status = JobStatus::Running;
        job.started_at = utc_now();
        job.current_step = job.spec.step;
        job.progress = 0.01;
        let _ = self.save(&job);

        let log = match JobLog::open(&job.log_path) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(error = %e, "could not open job log, continuing without");
                JobLog::disabled()
            }
        };

        let outcome = self.execute(&mut job, &log).await;

        match outcome {
            Ok(result) => {
                job.status = JobStatus::Succeeded;
                job.progress = 1.0;
                job.result = result;
            }
            Err(e) => {
                log.error(format!("job failed: {e}"));
                job.status = JobStatus::Failed;
                job.error = e.to_string();
            }
        }
        job.finished_at = utc_now();
        let _ = self.save(&job);

        let mut current = self.current_job.lock();
        if current.as_deref() == Some(job.job_id.as_str()) {
            *current = None;
        }
    }

    async fn execute(&self, job: &mut PipelineJob, log: &JobLog) -> Result<Value> {
        match job.spec.step {
            None => {
                let total_steps = 5u32;
                let mut merged = serde_json::Map::new();
                for step in 1..=total_steps {
                    job.current_step = Some(step);
                    job.progress = f64::from(step - 1) / f64::from(total_steps);
                    self.save(job)?;

                    let step_spec = PipelineRunSpec {
                        step: Some(step),
                        force: job.spec.force,
                        redo_chapter: job.spec.redo_chapter,
                    };
                    let result = self.runner.run(&job.novel_id, &step_spec, log).await?;
                    if let Value::Object(map) = result {
                        merged.extend(map);
                    }
                }
                job.current_step = Some(total_steps);
                merged.insert("mode".to_string(), Value::String("full".to_string()));
                Ok(Value::Object(merged))
            }
            Some(step) => {
                job.current_step = Some(step);
                job.progress = 0.1;
                self.save(job)?;
                self.runner.run(&job.novel_id, &job.spec, log).await
            }
        }
    }

    /// Tail of the job's log file; `lines` is clamped to 1..=2000.
    pub fn tail_logs(&self, job_id: &str, lines: usize) -> Result<String> {
        let job = self.get(job_id)?;
        let lines = lines.clamp(1, 2000);
        Ok(tail_file(Path::new(&job.log_path), lines))
    }
}
