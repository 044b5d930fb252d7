//! The persistent, transactional queue of work units. This is the only shared mutable state of
//! the controller; the job directories on disk are derived from it.

use std::{path::Path, time::Duration};

use creel_worker::{JobId, Lumi};
use error_stack::{Report, ResultExt};
use futures::TryStreamExt;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::scheduler::RetryPolicy;

#[cfg(test)]
mod tests;

pub type UnitId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open the work unit store")]
    Open,
    #[error("Work unit store transaction failed")]
    Transaction,
    #[error("Workflow {0} is already registered")]
    AlreadyRegistered(String),
    #[error("Outputs of workflow {0} are already claimed by another merge")]
    MergeConflict(String),
    #[error("Job {0} does not exist")]
    UnknownJob(JobId),
    #[error("Corrupt record in the work unit store")]
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    Running,
    Failed,
    Successful,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Failed => "failed",
            UnitStatus::Successful => "successful",
        }
    }

    fn parse(s: &str) -> Result<Self, Report<StoreError>> {
        match s {
            "pending" => Ok(UnitStatus::Pending),
            "running" => Ok(UnitStatus::Running),
            "failed" => Ok(UnitStatus::Failed),
            "successful" => Ok(UnitStatus::Successful),
            other => Err(Report::new(StoreError::Corrupt))
                .attach_printable_lazy(|| format!("Unknown unit status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Regular,
    Merge,
}

impl JobKind {
    fn as_str(&self) -> &'static str {
        match self {
            JobKind::Regular => "regular",
            JobKind::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Failed,
    Successful,
}

impl JobStatus {
    /// The name of the folder holding job directories in this state.
    pub fn dir_name(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Successful => "successful",
        }
    }
}

/// A work unit that has not been stored yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUnit {
    pub files: Vec<String>,
    pub lumis: Vec<Lumi>,
    /// A unique argument passed only to jobs covering this unit.
    pub arg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: UnitId,
    pub workflow: String,
    pub files: Vec<String>,
    pub lumis: Vec<Lumi>,
    pub arg: Option<String>,
    pub status: UnitStatus,
    pub attempts: u32,
}

/// A group of claimed units from one workflow, covered by one job.
#[derive(Debug, Clone)]
pub struct Batch {
    pub job: JobId,
    pub workflow: String,
    pub arg: Option<String>,
    pub units: Vec<WorkUnit>,
}

impl Batch {
    pub fn files(&self) -> Vec<String> {
        self.units
            .iter()
            .flat_map(|unit| unit.files.iter().cloned())
            .collect()
    }

    pub fn lumis(&self) -> Vec<Lumi> {
        let mut lumis = self
            .units
            .iter()
            .flat_map(|unit| unit.lumis.iter().copied())
            .collect::<Vec<_>>();
        lumis.sort();
        lumis.dedup();
        lumis
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub workflow: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub log: Option<String>,
}

/// An output file staged by a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub id: i64,
    pub workflow: String,
    pub job: JobId,
    /// Path relative to the stageout root.
    pub path: String,
    /// The execution report of the job that produced it.
    pub report: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct NewOutput {
    pub path: String,
    pub report: String,
    pub size: u64,
    /// The output waits to be merged instead of being final.
    pub mergeable: bool,
}

/// A unit to create in a dependent workflow from a final output.
#[derive(Debug, Clone)]
pub struct DownstreamUnit {
    pub workflow: String,
    pub unit: NewUnit,
}

/// Everything recorded when a job finishes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub failed: bool,
    pub log: Option<String>,
    pub outputs: Vec<NewOutput>,
    pub downstream: Vec<DownstreamUnit>,
}

impl Completion {
    pub fn new(failed: bool) -> Self {
        Self {
            failed,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum Completed {
    /// The job was running and its units were updated.
    Applied {
        units: Vec<WorkUnit>,
        /// Ids of the recorded outputs, in the order they were given.
        outputs: Vec<i64>,
    },
    /// The job had already been completed. Only its log was updated.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCounts {
    pub pending: u64,
    pub running: u64,
    /// Failed units that may still be retried.
    pub failed: u64,
    /// Failed units that reached the attempt cap.
    pub exhausted: u64,
    pub successful: u64,
}

impl UnitCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.failed + self.exhausted + self.successful
    }

    pub fn unfinished(&self) -> u64 {
        self.pending + self.running + self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub units: u64,
    pub jobs: u64,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflows (
        label TEXT PRIMARY KEY,
        registered_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS units (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow TEXT NOT NULL,
        files TEXT NOT NULL,
        lumis TEXT NOT NULL,
        arg TEXT,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        job INTEGER,
        failed_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS units_by_status ON units (status, workflow)",
    "CREATE INDEX IF NOT EXISTS units_by_job ON units (job)",
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        log TEXT,
        created_at INTEGER NOT NULL,
        finished_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS outputs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow TEXT NOT NULL,
        job INTEGER NOT NULL,
        path TEXT NOT NULL,
        report TEXT NOT NULL,
        size INTEGER NOT NULL,
        mergeable INTEGER NOT NULL,
        merge_job INTEGER,
        merged INTEGER NOT NULL DEFAULT 0
    )",
];

type UnitRow = (i64, String, String, String, Option<String>, String, i64);

const UNIT_COLUMNS: &str = "id, workflow, files, lumis, arg, status, attempts";

fn unit_from_row(row: UnitRow) -> Result<WorkUnit, Report<StoreError>> {
    let (id, workflow, files, lumis, arg, status, attempts) = row;
    Ok(WorkUnit {
        id,
        files: serde_json::from_str(&files)
            .change_context(StoreError::Corrupt)
            .attach_printable_lazy(|| format!("files of unit {id}"))?,
        lumis: serde_json::from_str(&lumis)
            .change_context(StoreError::Corrupt)
            .attach_printable_lazy(|| format!("lumis of unit {id}"))?,
        workflow,
        arg,
        status: UnitStatus::parse(&status)?,
        attempts: attempts as u32,
    })
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

async fn insert_unit(
    conn: &mut SqliteConnection,
    workflow: &str,
    unit: &NewUnit,
) -> Result<(), Report<StoreError>> {
    let files = serde_json::to_string(&unit.files).change_context(StoreError::Transaction)?;
    let lumis = serde_json::to_string(&unit.lumis).change_context(StoreError::Transaction)?;
    sqlx::query(
        "INSERT INTO units (workflow, files, lumis, arg, status, attempts)
        VALUES (?, ?, ?, ?, 'pending', 0)",
    )
    .bind(workflow)
    .bind(files)
    .bind(lumis)
    .bind(unit.arg.as_deref())
    .execute(conn)
    .await
    .change_context(StoreError::Transaction)?;
    Ok(())
}

struct OpenBatch {
    workflow: String,
    arg: Option<String>,
    cap: usize,
    units: Vec<WorkUnit>,
}

pub struct WorkUnitStore {
    pool: SqlitePool,
    retry: RetryPolicy,
    /// Serializes every mutating transaction.
    write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for WorkUnitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnitStore")
            .field("retry", &self.retry)
            .finish()
    }
}

impl WorkUnitStore {
    /// Open the store at `path`, creating it if needed.
    #[instrument(level = "debug", skip(retry))]
    pub async fn open(path: &Path, retry: RetryPolicy) -> Result<Self, Report<StoreError>> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .change_context(StoreError::Open)
            .attach_printable_lazy(|| path.display().to_string())?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .change_context(StoreError::Open)?;
        }

        Ok(Self {
            pool,
            retry,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn is_registered(&self, workflow: &str) -> Result<bool, Report<StoreError>> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT label FROM workflows WHERE label = ?")
                .bind(workflow)
                .fetch_optional(&self.pool)
                .await
                .change_context(StoreError::Transaction)?;
        Ok(found.is_some())
    }

    /// Insert the initial work units of a workflow. This fails if the workflow was registered
    /// before.
    #[instrument(level = "debug", skip(self, units), fields(units = units.len()))]
    pub async fn register(
        &self,
        workflow: &str,
        units: &[NewUnit],
    ) -> Result<(), Report<StoreError>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StoreError::Transaction)?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT label FROM workflows WHERE label = ?")
                .bind(workflow)
                .fetch_optional(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?;
        if existing.is_some() {
            return Err(Report::new(StoreError::AlreadyRegistered(
                workflow.to_string(),
            )));
        }

        sqlx::query("INSERT INTO workflows (label, registered_at) VALUES (?, ?)")
            .bind(workflow)
            .bind(now())
            .execute(&mut *tx)
            .await
            .change_context(StoreError::Transaction)?;

        for unit in units {
            insert_unit(&mut tx, workflow, unit).await?;
        }

        tx.commit().await.change_context(StoreError::Transaction)?;
        event!(Level::INFO, %workflow, units = units.len(), "registered work units");
        Ok(())
    }

    /// Revert everything left running by a previous incarnation of the controller. Running units
    /// count as a failed attempt, running jobs are marked failed and outputs claimed by running
    /// merge jobs become available again.
    #[instrument(level = "debug", skip(self))]
    pub async fn reset(&self) -> Result<ResetSummary, Report<StoreError>> {
        let now = now();
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StoreError::Transaction)?;

        sqlx::query(
            "UPDATE outputs SET merge_job = NULL WHERE merge_job IN
            (SELECT id FROM jobs WHERE status = 'running' AND kind = 'merge')",
        )
        .execute(&mut *tx)
        .await
        .change_context(StoreError::Transaction)?;

        let units = sqlx::query(
            "UPDATE units SET status = 'failed', attempts = attempts + 1, failed_at = ?
            WHERE status = 'running'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .change_context(StoreError::Transaction)?
        .rows_affected();

        let jobs = sqlx::query(
            "UPDATE jobs SET status = 'failed', finished_at = ? WHERE status = 'running'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await
        .change_context(StoreError::Transaction)?
        .rows_affected();

        tx.commit().await.change_context(StoreError::Transaction)?;

        if units > 0 || jobs > 0 {
            event!(Level::WARN, %units, %jobs, "reverted work left running by a previous run");
        }

        Ok(ResetSummary { units, jobs })
    }

    /// Claim work. Each entry of `caps` allows one batch of at most that many units; the units
    /// of a batch share a workflow and unique argument. Claimed units are marked running and
    /// a running job is created for every batch.
    #[instrument(level = "debug", skip(self))]
    pub async fn claim(&self, caps: &[usize]) -> Result<Vec<Batch>, Report<StoreError>> {
        let caps = caps.iter().copied().filter(|cap| *cap > 0).collect::<Vec<_>>();
        if caps.is_empty() {
            return Ok(Vec::new());
        }

        let now = now();

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StoreError::Transaction)?;

        let mut batches: Vec<OpenBatch> = Vec::with_capacity(caps.len());
        {
            let mut rows = sqlx::query_as::<_, (i64, String, String, String, Option<String>, String, i64, Option<i64>)>(
                "SELECT id, workflow, files, lumis, arg, status, attempts, failed_at FROM units
                WHERE status = 'pending' OR (status = 'failed' AND attempts < ?)
                ORDER BY id",
            )
            .bind(self.retry.attempt_cap())
            .fetch(&mut *tx);

            // Units whose batch is already full are skipped, so keep scanning until every
            // batch is full rather than stopping after a fixed number of rows.
            while let Some(row) = rows
                .try_next()
                .await
                .change_context(StoreError::Transaction)?
            {
                let (id, workflow, files, lumis, arg, status, attempts, failed_at) = row;
                let unit = unit_from_row((id, workflow, files, lumis, arg, status, attempts))?;

                if unit.status == UnitStatus::Failed {
                    let backoff = self.retry.backoff(unit.attempts).as_secs() as i64;
                    if failed_at.unwrap_or(0) + backoff > now {
                        continue;
                    }
                }

                let open = batches.iter().position(|batch| {
                    batch.workflow == unit.workflow
                        && batch.arg == unit.arg
                        && batch.units.len() < batch.cap
                });

                match open {
                    Some(i) => batches[i].units.push(unit),
                    None if batches.len() < caps.len() => {
                        let cap = caps[batches.len()];
                        batches.push(OpenBatch {
                            workflow: unit.workflow.clone(),
                            arg: unit.arg.clone(),
                            cap,
                            units: vec![unit],
                        });
                    }
                    None => {}
                }

                if batches.len() == caps.len()
                    && batches.iter().all(|batch| batch.units.len() >= batch.cap)
                {
                    break;
                }
            }
        }

        let mut claimed = Vec::with_capacity(batches.len());
        for batch in batches {
            let job = sqlx::query(
                "INSERT INTO jobs (workflow, kind, status, created_at) VALUES (?, ?, 'running', ?)",
            )
            .bind(&batch.workflow)
            .bind(JobKind::Regular.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .change_context(StoreError::Transaction)?
            .last_insert_rowid();

            let mut units = batch.units;
            for unit in units.iter_mut() {
                sqlx::query("UPDATE units SET status = 'running', job = ? WHERE id = ?")
                    .bind(job)
                    .bind(unit.id)
                    .execute(&mut *tx)
                    .await
                    .change_context(StoreError::Transaction)?;
                unit.status = UnitStatus::Running;
            }

            claimed.push(Batch {
                job: JobId(job),
                workflow: batch.workflow,
                arg: batch.arg,
                units,
            });
        }

        tx.commit().await.change_context(StoreError::Transaction)?;

        event!(Level::DEBUG, batches = claimed.len(), "claimed work");
        Ok(claimed)
    }

    /// Create a running merge job that consumes the given outputs of `workflow`.
    #[instrument(level = "debug", skip(self, outputs), fields(outputs = outputs.len()))]
    pub async fn claim_merge(
        &self,
        workflow: &str,
        outputs: &[i64],
    ) -> Result<JobId, Report<StoreError>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StoreError::Transaction)?;

        let job = sqlx::query(
            "INSERT INTO jobs (workflow, kind, status, created_at) VALUES (?, ?, 'running', ?)",
        )
        .bind(workflow)
        .bind(JobKind::Merge.as_str())
        .bind(now())
        .execute(&mut *tx)
        .await
        .change_context(StoreError::Transaction)?
        .last_insert_rowid();

        for output in outputs {
            let updated = sqlx::query(
                "UPDATE outputs SET merge_job = ?
                WHERE id = ? AND workflow = ? AND mergeable = 1 AND merged = 0
                AND merge_job IS NULL",
            )
            .bind(job)
            .bind(output)
            .bind(workflow)
            .execute(&mut *tx)
            .await
            .change_context(StoreError::Transaction)?
            .rows_affected();

            if updated != 1 {
                // Dropping the transaction rolls it back.
                return Err(Report::new(StoreError::MergeConflict(workflow.to_string())))
                    .attach_printable_lazy(|| format!("Output {output}"));
            }
        }

        tx.commit().await.change_context(StoreError::Transaction)?;
        Ok(JobId(job))
    }

    /// Mark the units of job `id` as failed or successful.
    pub async fn complete(
        &self,
        id: JobId,
        failed: bool,
    ) -> Result<Completed, Report<StoreError>> {
        self.complete_with(id, Completion::new(failed)).await
    }

    /// Finish job `id`. Failed units have their attempt count incremented and become eligible
    /// for retry. On success the job's outputs and the units it creates in dependent workflows
    /// are recorded in the same transaction. Completing a job twice only replaces its log.
    #[instrument(level = "debug", skip(self, completion), fields(failed = completion.failed))]
    pub async fn complete_with(
        &self,
        id: JobId,
        completion: Completion,
    ) -> Result<Completed, Report<StoreError>> {
        let now = now();
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .change_context(StoreError::Transaction)?;

        let job: Option<(String, String, String)> =
            sqlx::query_as("SELECT workflow, kind, status FROM jobs WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?;
        let Some((workflow, kind, status)) = job else {
            return Err(Report::new(StoreError::UnknownJob(id)));
        };

        if let Some(log) = completion.log.as_deref() {
            sqlx::query("UPDATE jobs SET log = ? WHERE id = ?")
                .bind(log)
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?;
        }

        if status != "running" {
            tx.commit().await.change_context(StoreError::Transaction)?;
            event!(Level::DEBUG, job = %id, %workflow, "job was already completed");
            return Ok(Completed::Duplicate);
        }

        let new_status = if completion.failed {
            JobStatus::Failed
        } else {
            JobStatus::Successful
        };
        sqlx::query("UPDATE jobs SET status = ?, finished_at = ? WHERE id = ?")
            .bind(new_status.dir_name())
            .bind(now)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .change_context(StoreError::Transaction)?;

        if completion.failed {
            sqlx::query(
                "UPDATE units SET status = 'failed', attempts = attempts + 1, failed_at = ?
                WHERE job = ? AND status = 'running'",
            )
            .bind(now)
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .change_context(StoreError::Transaction)?;
        } else {
            sqlx::query("UPDATE units SET status = 'successful' WHERE job = ? AND status = 'running'")
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?;
        }

        if kind == JobKind::Merge.as_str() {
            let statement = if completion.failed {
                "UPDATE outputs SET merge_job = NULL WHERE merge_job = ?"
            } else {
                "UPDATE outputs SET merged = 1 WHERE merge_job = ?"
            };
            sqlx::query(statement)
                .bind(id.0)
                .execute(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?;
        }

        let mut outputs = Vec::new();
        if !completion.failed {
            for output in &completion.outputs {
                let output_id = sqlx::query(
                    "INSERT INTO outputs (workflow, job, path, report, size, mergeable)
                    VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&workflow)
                .bind(id.0)
                .bind(&output.path)
                .bind(&output.report)
                .bind(output.size as i64)
                .bind(output.mergeable)
                .execute(&mut *tx)
                .await
                .change_context(StoreError::Transaction)?
                .last_insert_rowid();
                outputs.push(output_id);
            }

            for downstream in &completion.downstream {
                insert_unit(&mut tx, &downstream.workflow, &downstream.unit).await?;
            }
        }

        let units = sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM units WHERE job = ? ORDER BY id"
        ))
        .bind(id.0)
        .fetch_all(&mut *tx)
        .await
        .change_context(StoreError::Transaction)?
        .into_iter()
        .map(unit_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        tx.commit().await.change_context(StoreError::Transaction)?;

        Ok(Completed::Applied { units, outputs })
    }

    /// The number of units that are pending, running, or failed but retryable.
    pub async fn unfinished_count(&self) -> Result<u64, Report<StoreError>> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM units
            WHERE status IN ('pending', 'running') OR (status = 'failed' AND attempts < ?)",
        )
        .bind(self.retry.attempt_cap())
        .fetch_one(&self.pool)
        .await
        .change_context(StoreError::Transaction)?;
        Ok(count as u64)
    }

    pub async fn unfinished_count_for(&self, workflow: &str) -> Result<u64, Report<StoreError>> {
        Ok(self.counts(workflow).await?.unfinished())
    }

    pub async fn done(&self) -> Result<bool, Report<StoreError>> {
        Ok(self.unfinished_count().await? == 0)
    }

    /// Per-state unit counts for one workflow.
    pub async fn counts(&self, workflow: &str) -> Result<UnitCounts, Report<StoreError>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT status, attempts < ? AS retryable, COUNT(*) FROM units
            WHERE workflow = ? GROUP BY status, retryable",
        )
        .bind(self.retry.attempt_cap())
        .bind(workflow)
        .fetch_all(&self.pool)
        .await
        .change_context(StoreError::Transaction)?;

        let mut counts = UnitCounts::default();
        for (status, retryable, count) in rows {
            let count = count as u64;
            match UnitStatus::parse(&status)? {
                UnitStatus::Pending => counts.pending += count,
                UnitStatus::Running => counts.running += count,
                UnitStatus::Failed if retryable != 0 => counts.failed += count,
                UnitStatus::Failed => counts.exhausted += count,
                UnitStatus::Successful => counts.successful += count,
            }
        }

        Ok(counts)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, Report<StoreError>> {
        let row: Option<(String, String, String, Option<String>)> =
            sqlx::query_as("SELECT workflow, kind, status, log FROM jobs WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .change_context(StoreError::Transaction)?;

        let Some((workflow, kind, status, log)) = row else {
            return Ok(None);
        };

        let kind = match kind.as_str() {
            "regular" => JobKind::Regular,
            "merge" => JobKind::Merge,
            other => {
                return Err(Report::new(StoreError::Corrupt))
                    .attach_printable_lazy(|| format!("Unknown job kind {other}"))
            }
        };

        let status = match status.as_str() {
            "running" => JobStatus::Running,
            "failed" => JobStatus::Failed,
            "successful" => JobStatus::Successful,
            other => {
                return Err(Report::new(StoreError::Corrupt))
                    .attach_printable_lazy(|| format!("Unknown job status {other}"))
            }
        };

        Ok(Some(JobRecord {
            id,
            workflow,
            kind,
            status,
            log,
        }))
    }

    /// The units most recently claimed by job `id`.
    pub async fn job_units(&self, id: JobId) -> Result<Vec<WorkUnit>, Report<StoreError>> {
        sqlx::query_as::<_, UnitRow>(&format!(
            "SELECT {UNIT_COLUMNS} FROM units WHERE job = ? ORDER BY id"
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .change_context(StoreError::Transaction)?
        .into_iter()
        .map(unit_from_row)
        .collect()
    }

    /// Outputs of `workflow` waiting to be merged and not claimed by a merge job.
    pub async fn unmerged_outputs(
        &self,
        workflow: &str,
    ) -> Result<Vec<OutputRecord>, Report<StoreError>> {
        let rows: Vec<(i64, String, i64, String, String, i64)> = sqlx::query_as(
            "SELECT id, workflow, job, path, report, size FROM outputs
            WHERE workflow = ? AND mergeable = 1 AND merged = 0 AND merge_job IS NULL
            ORDER BY id",
        )
        .bind(workflow)
        .fetch_all(&self.pool)
        .await
        .change_context(StoreError::Transaction)?;

        Ok(rows
            .into_iter()
            .map(|(id, workflow, job, path, report, size)| OutputRecord {
                id,
                workflow,
                job: JobId(job),
                path,
                report,
                size: size as u64,
            })
            .collect())
    }
}
