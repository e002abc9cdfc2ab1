//! PostgreSQL job storage.

use super::{ClaimFilter, FailJobParams, JobStorage};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grafto_config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, instructions, executor, state, scheduled_for, failed_attempts, \
                           repeatable_key, last_error, created_at, updated_at";

/// Creates a connection pool from configuration.
pub async fn create_pool(config: &DatabaseConfig) -> JobResult<PgPool> {
    info!("Connecting to PostgreSQL database...");

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .connect(&config.url)
        .await
        .map_err(|e| {
            warn!("Failed to connect to database: {}", e);
            JobError::Database(e)
        })?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Runs the embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> JobResult<()> {
    info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

/// Job storage backed by the `jobs` table.
#[derive(Clone)]
pub struct PgJobStorage {
    pool: PgPool,
}

impl PgJobStorage {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explains why a claim-guarded update matched no row.
    async fn ensure_claimed(&self, id: JobId, rows: u64) -> JobResult<()> {
        if rows > 0 {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id.into_inner())
            .fetch_one(&self.pool)
            .await?;

        if exists {
            Err(JobError::ClaimLost(id.to_string()))
        } else {
            Err(JobError::NotFound(id.to_string()))
        }
    }

    /// Returns a reference to the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PgJobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobStorage")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    instructions: Vec<u8>,
    executor: String,
    state: String,
    scheduled_for: DateTime<Utc>,
    failed_attempts: i32,
    repeatable_key: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let failed_attempts = u32::try_from(row.failed_attempts).map_err(|_| {
            JobError::Storage(format!("Negative failed_attempts for job {}", row.id))
        })?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            instructions: row.instructions,
            executor: row.executor,
            state: row.state.parse()?,
            scheduled_for: row.scheduled_for,
            failed_attempts,
            repeatable_key: row.repeatable_key,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u32) -> i64 {
    i64::from(value)
}


#[async_trait]
impl JobStorage for PgJobStorage {
    async fn insert_job(&self, job: &Job) -> JobResult<()> {
        debug!(job_id = %job.id, executor = %job.executor, "Inserting job");

        sqlx::query(
            r#"
            INSERT INTO jobs (id, instructions, executor, state, scheduled_for, failed_attempts,
                              repeatable_key, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.into_inner())
        .bind(&job.instructions)
        .bind(&job.executor)
        .bind(job.state.as_str())
        .bind(job.scheduled_for)
        .bind(to_i32(job.failed_attempts))
        .bind(&job.repeatable_key)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_repeatable_job(&self, job: &Job) -> JobResult<bool> {
        debug!(job_id = %job.id, key = ?job.repeatable_key, "Inserting repeatable job");

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, instructions, executor, state, scheduled_for, failed_attempts,
                              repeatable_key, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (repeatable_key) WHERE state IN ('queued', 'running') DO NOTHING
            "#,
        )
        .bind(job.id.into_inner())
        .bind(&job.instructions)
        .bind(&job.executor)
        .bind(job.state.as_str())
        .bind(job.scheduled_for)
        .bind(to_i32(job.failed_attempts))
        .bind(&job.repeatable_key)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_jobs(&self, filter: &ClaimFilter) -> JobResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            WITH ready AS (
                SELECT id FROM jobs
                WHERE ((state = 'queued' AND scheduled_for <= $1)
                       OR (state = 'running' AND updated_at < $4::timestamptz))
                  AND failed_attempts < $2
                ORDER BY scheduled_for, created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET state = 'running', updated_at = $1
            FROM ready
            WHERE jobs.id = ready.id
            RETURNING jobs.*
            "#,
        )
        .bind(filter.now)
        .bind(to_i32(filter.max_retries))
        .bind(to_i64(filter.limit))
        .bind(filter.stale_before)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<JobResult<Vec<_>>>()?;

        // UPDATE ... RETURNING does not preserve the CTE ordering.
        jobs.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(jobs)
    }

    async fn complete_job(&self, job: &Job, now: DateTime<Utc>) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'done', updated_at = $3
            WHERE id = $1 AND state = 'running' AND updated_at = $2
            "#,
        )
        .bind(job.id.into_inner())
        .bind(job.updated_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.ensure_claimed(job.id, result.rows_affected()).await
    }

    async fn fail_job(&self, params: &FailJobParams) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, failed_attempts = $3, scheduled_for = $4, last_error = $5, updated_at = $6
            WHERE id = $1 AND state = 'running' AND updated_at = $7
            "#,
        )
        .bind(params.id.into_inner())
        .bind(params.state.as_str())
        .bind(to_i32(params.failed_attempts))
        .bind(params.scheduled_for)
        .bind(&params.error)
        .bind(params.updated_at)
        .bind(params.claimed_at)
        .execute(&self.pool)
        .await?;

        self.ensure_claimed(params.id, result.rows_affected()).await
    }

    async fn reschedule_repeatable_job(
        &self,
        job: &Job,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued', scheduled_for = $2, failed_attempts = 0, last_error = NULL, updated_at = $3
            WHERE id = $1 AND state = 'running' AND updated_at = $4
            "#,
        )
        .bind(job.id.into_inner())
        .bind(scheduled_for)
        .bind(now)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        self.ensure_claimed(job.id, result.rows_affected()).await
    }

    async fn repeatable_job_exists(&self, key: &str) -> JobResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM jobs WHERE repeatable_key = $1 AND state IN ('queued', 'running')
            )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get_job(&self, id: JobId) -> JobResult<Option<Job>> {
        let query = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn clear_jobs(&self) -> JobResult<u64> {
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> JobResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'done' AND updated_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    fn row(state: &str, failed_attempts: i32) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::now_v7(),
            instructions: b"{}".to_vec(),
            executor: "email_job_executor".to_string(),
            state: state.to_string(),
            scheduled_for: now,
            failed_attempts,
            repeatable_key: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_conversion() {
        let job = Job::try_from(row("running", 2)).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.failed_attempts, 2);
    }

    #[test]
    fn test_row_conversion_rejects_bad_state() {
        assert!(Job::try_from(row("paused", 0)).is_err());
    }

    #[test]
    fn test_row_conversion_rejects_negative_attempts() {
        assert!(Job::try_from(row("queued", -1)).is_err());
    }
}
