//! Durable job queue. Every operation runs under one store-wide lock so next-run ordering
//! and existence checks stay atomic with respect to concurrent dispatch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundscope_core::{JobKey, JobOptions, JobStatus, ScheduledJob};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;

use crate::StoreError;

/// Predicate over stored jobs; `ScheduledJobs` returns rows matching every matcher given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMatcher {
    Group(String),
    JobType(String),
    Status(JobStatus),
    DueBefore(DateTime<Utc>),
    DueAfter(DateTime<Utc>),
}

impl JobMatcher {
    pub fn matches(&self, job: &ScheduledJob) -> bool {
        match self {
            JobMatcher::Group(group) => &job.key.group == group,
            JobMatcher::JobType(job_type) => &job.job_type == job_type,
            JobMatcher::Status(status) => job.status == *status,
            JobMatcher::DueBefore(at) => job.next_run_time <= *at,
            JobMatcher::DueAfter(at) => job.next_run_time > *at,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a pending job. A pending row with the same key is replaced only when
    /// `job.options.replace` is set; terminal rows are always overwritten.
    async fn push(&self, job: ScheduledJob) -> Result<(), StoreError>;

    /// Removes and returns the pending job with the smallest next-run time.
    async fn pop(&self) -> Result<ScheduledJob, StoreError>;

    async fn head(&self) -> Result<ScheduledJob, StoreError>;

    async fn get(&self, key: &JobKey) -> Result<ScheduledJob, StoreError>;

    async fn remove(&self, key: &JobKey) -> Result<ScheduledJob, StoreError>;

    async fn scheduled_jobs(
        &self,
        matchers: &[JobMatcher],
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Number of pending jobs.
    async fn size(&self) -> Result<usize, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Persists a finished or dead-lettered job without clobbering a pending job that
    /// reused the key in the meantime.
    async fn record_outcome(&self, job: ScheduledJob) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<BTreeMap<JobKey, ScheduledJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn earliest(rows: &BTreeMap<JobKey, ScheduledJob>) -> Option<&ScheduledJob> {
        rows.values()
            .filter(|job| job.status == JobStatus::Scheduled)
            .min_by(|a, b| {
                a.next_run_time
                    .cmp(&b.next_run_time)
                    .then_with(|| a.key.cmp(&b.key))
            })
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn push(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(&job.key) {
            if existing.status == JobStatus::Scheduled && !job.options.replace {
                return Err(StoreError::DuplicateJob(job.key));
            }
        }
        rows.insert(job.key.clone(), job);
        Ok(())
    }

    async fn pop(&self) -> Result<ScheduledJob, StoreError> {
        let mut rows = self.rows.lock().await;
        let key = Self::earliest(&rows)
            .map(|job| job.key.clone())
            .ok_or(StoreError::QueueEmpty)?;
        rows.remove(&key).ok_or(StoreError::QueueEmpty)
    }

    async fn head(&self) -> Result<ScheduledJob, StoreError> {
        let rows = self.rows.lock().await;
        Self::earliest(&rows).cloned().ok_or(StoreError::QueueEmpty)
    }

    async fn get(&self, key: &JobKey) -> Result<ScheduledJob, StoreError> {
        let rows = self.rows.lock().await;
        rows.get(key)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(key.clone()))
    }

    async fn remove(&self, key: &JobKey) -> Result<ScheduledJob, StoreError> {
        let mut rows = self.rows.lock().await;
        rows.remove(key)
            .ok_or_else(|| StoreError::JobNotFound(key.clone()))
    }

    async fn scheduled_jobs(
        &self,
        matchers: &[JobMatcher],
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out: Vec<ScheduledJob> = rows
            .values()
            .filter(|job| matchers.iter().all(|m| m.matches(job)))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.next_run_time
                .cmp(&b.next_run_time)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|job| job.status == JobStatus::Scheduled)
            .count())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rows.lock().await.clear();
        Ok(())
    }

    async fn record_outcome(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if matches!(rows.get(&job.key), Some(existing) if existing.status == JobStatus::Scheduled) {
            return Ok(());
        }
        rows.insert(job.key.clone(), job);
        Ok(())
    }
}

const JOB_COLUMNS: &str = "job_name, job_group, job_type, job_description, job_options, \
                           next_run_time, job_status, trigger_description, attempts, last_error";

/// Postgres-backed queue over the `scheduled_jobs` table.
#[derive(Debug)]
pub struct PgJobStore {
    pool: PgPool,
    lock: Mutex<()>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock: Mutex::new(()),
        }
    }

    async fn upsert(&self, job: &ScheduledJob, force: bool) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (job_key, job_name, job_group, job_type, job_description, job_options,
                 next_run_time, job_status, trigger_description, attempts, last_error,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (job_key) DO UPDATE
               SET job_type = EXCLUDED.job_type,
                   job_description = EXCLUDED.job_description,
                   job_options = EXCLUDED.job_options,
                   next_run_time = EXCLUDED.next_run_time,
                   job_status = EXCLUDED.job_status,
                   trigger_description = EXCLUDED.trigger_description,
                   attempts = EXCLUDED.attempts,
                   last_error = EXCLUDED.last_error,
                   updated_at = NOW()
             WHERE scheduled_jobs.job_status <> 'scheduled' OR $12
            "#,
        )
        .bind(job.key.to_string())
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(Json(job.options))
        .bind(job.next_run_time)
        .bind(job.status.as_str())
        .bind(&job.trigger)
        .bind(i32::try_from(job.attempts).unwrap_or(i32::MAX))
        .bind(&job.last_error)
        .bind(force)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> Result<ScheduledJob, StoreError> {
    let status: String = row.try_get("job_status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    let options: Json<JobOptions> = row.try_get("job_options")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(ScheduledJob {
        key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        job_type: row.try_get("job_type")?,
        description: row.try_get("job_description")?,
        next_run_time: row.try_get("next_run_time")?,
        status,
        trigger: row.try_get("trigger_description")?,
        options: options.0,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn push(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let replace = job.options.replace;
        if self.upsert(&job, replace).await? == 0 {
            return Err(StoreError::DuplicateJob(job.key));
        }
        Ok(())
    }

    async fn pop(&self) -> Result<ScheduledJob, StoreError> {
        let _guard = self.lock.lock().await;
        let sql = format!(
            r#"
            DELETE FROM scheduled_jobs
             WHERE id = (
                SELECT id FROM scheduled_jobs
                 WHERE job_status = 'scheduled'
                 ORDER BY next_run_time, job_key
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::QueueEmpty)?;
        job_from_row(&row)
    }

    async fn head(&self) -> Result<ScheduledJob, StoreError> {
        let _guard = self.lock.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_status = 'scheduled' \
             ORDER BY next_run_time, job_key LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::QueueEmpty)?;
        job_from_row(&row)
    }

    async fn get(&self, key: &JobKey) -> Result<ScheduledJob, StoreError> {
        let _guard = self.lock.lock().await;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE job_key = $1");
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(key.clone()))?;
        job_from_row(&row)
    }

    async fn remove(&self, key: &JobKey) -> Result<ScheduledJob, StoreError> {
        let _guard = self.lock.lock().await;
        let sql = format!("DELETE FROM scheduled_jobs WHERE job_key = $1 RETURNING {JOB_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(key.clone()))?;
        job_from_row(&row)
    }

    async fn scheduled_jobs(
        &self,
        matchers: &[JobMatcher],
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE TRUE"));
        for matcher in matchers {
            match matcher {
                JobMatcher::Group(group) => {
                    qb.push(" AND job_group = ").push_bind(group.clone());
                }
                JobMatcher::JobType(job_type) => {
                    qb.push(" AND job_type = ").push_bind(job_type.clone());
                }
                JobMatcher::Status(status) => {
                    qb.push(" AND job_status = ").push_bind(status.as_str());
                }
                JobMatcher::DueBefore(at) => {
                    qb.push(" AND next_run_time <= ").push_bind(*at);
                }
                JobMatcher::DueAfter(at) => {
                    qb.push(" AND next_run_time > ").push_bind(*at);
                }
            }
        }
        qb.push(" ORDER BY next_run_time, job_key");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs WHERE job_status = 'scheduled'")
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        sqlx::query("DELETE FROM scheduled_jobs")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_outcome(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.upsert(&job, false).await?;
        Ok(())
    }
}
