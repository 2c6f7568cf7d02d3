//! Postgres-backed job store.
//!
//! One row per job in the `jobs` table; payload and result are `jsonb`.
//! Optimistic concurrency is a conditional update:
//!
//! ```sql
//! UPDATE jobs SET ..., version = version + 1
//! WHERE id = $1 AND ($n::bigint IS NULL OR version = $n)
//! RETURNING version
//! ```
//!
//! Zero affected rows means either the job is unknown or another writer got
//! there first; a follow-up `SELECT version` tells which.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! ## Sync boundary
//!
//! The `JobStore` trait is synchronous (worker and reconciler threads are
//! plain OS threads). The store keeps a handle to the tokio runtime that owns
//! the pool and `block_on`s the async queries. It must therefore not be called
//! from inside that runtime's own worker threads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use jobrelay_core::{ExpectedVersion, JobId, WorkerId};
use jobrelay_jobs::{Job, JobStatus, Payload};

use super::{JobQuery, JobStats, JobStore, Page, PageRequest, StoreError};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        job_type VARCHAR(32) NOT NULL,
        status VARCHAR(32) NOT NULL,
        priority SMALLINT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        result JSONB,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        worker_id VARCHAR(255),
        version BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_job_type ON jobs (job_type)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at DESC)",
];

const JOB_COLUMNS: &str = "id, name, job_type, status, priority, payload, result, error_message, \
     retry_count, max_retries, created_at, updated_at, started_at, completed_at, worker_id, version";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect a small pool on `runtime`.
    pub fn connect(database_url: &str, runtime: Handle) -> Result<Self, StoreError> {
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(8)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, runtime))
    }

    /// Create the `jobs` table and its indexes (idempotent).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    pub fn migrate_blocking(&self) -> Result<(), StoreError> {
        self.runtime.block_on(self.migrate())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_job(&self, job: Job) -> Result<Job, StoreError> {
        let mut job = job;
        job.version = 1;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, job_type, status, priority, payload, result, error_message,
                retry_count, max_retries, created_at, updated_at, started_at, completed_at,
                worker_id, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(i16::from(job.priority))
        .bind(Json(&job.payload))
        .bind(job.result.as_ref().map(Json))
        .bind(job.error_message.as_deref())
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.worker_id.as_ref().map(|w| w.as_str()))
        .bind(job.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, status = %job.status, expected = ?expected),
        err
    )]
    pub async fn update_job(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        let expected_param: Option<i64> = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                name = $2,
                job_type = $3,
                status = $4,
                priority = $5,
                payload = $6,
                result = $7,
                error_message = $8,
                retry_count = $9,
                max_retries = $10,
                updated_at = $11,
                started_at = $12,
                completed_at = $13,
                worker_id = $14,
                version = version + 1
            WHERE id = $1 AND ($15::bigint IS NULL OR version = $15)
            RETURNING version
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(i16::from(job.priority))
        .bind(Json(&job.payload))
        .bind(job.result.as_ref().map(Json))
        .bind(job.error_message.as_deref())
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.worker_id.as_ref().map(|w| w.as_str()))
        .bind(expected_param)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if let Some(row) = row {
            let version: i64 = row
                .try_get("version")
                .map_err(|e| map_sqlx_error("update_job", e))?;
            let mut stored = job.clone();
            stored.version = version as u64;
            return Ok(stored);
        }

        let current = sqlx::query("SELECT version FROM jobs WHERE id = $1")
            .bind(job.id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;

        match current {
            None => Err(StoreError::NotFound(job.id)),
            Some(row) => {
                let actual: i64 = row
                    .try_get("version")
                    .map_err(|e| map_sqlx_error("update_job", e))?;
                Err(StoreError::VersionConflict {
                    job_id: job.id,
                    expected,
                    actual: actual as u64,
                })
            }
        }
    }

    pub async fn list_jobs(
        &self,
        query: &JobQuery,
        page: PageRequest,
    ) -> Result<Page<Job>, StoreError> {
        let status_param = query.status.map(|s| s.as_str());
        let type_param = query.job_type.map(|t| t.as_str());
        let name_param = query.name_contains.as_deref().map(like_pattern);

        let filter = r#"
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::text IS NULL OR name ILIKE $3)
        "#;

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM jobs {filter}"))
            .bind(status_param)
            .bind(type_param)
            .bind(name_param.as_deref())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs {filter} ORDER BY created_at DESC, id DESC LIMIT $4 OFFSET $5"
        ))
        .bind(status_param)
        .bind(type_param)
        .bind(name_param.as_deref())
        .bind(page.size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            size: page.size,
        })
    }

    pub async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("job_stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job_stats", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| StoreError::Storage(format!("bad status in jobs table: {e}")))?;
            stats.add(status, n as u64);
        }

        let avg_row = sqlx::query(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)::float8 AS avg_ms
            FROM jobs
            WHERE status = 'COMPLETED' AND started_at IS NOT NULL AND completed_at IS NOT NULL
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;
        let avg: Option<f64> = avg_row
            .try_get("avg_ms")
            .map_err(|e| map_sqlx_error("job_stats", e))?;
        stats.avg_execution_time_ms = avg.unwrap_or(0.0);

        Ok(stats)
    }
}

/// `ILIKE` pattern matching `fragment` literally anywhere in the name.
fn like_pattern(fragment: &str) -> String {
    let escaped = fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Storage(format!("failed to decode job row: {e}"));

    let id: uuid::Uuid = row.try_get("id").map_err(get_err)?;
    let job_type: String = row.try_get("job_type").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let priority: i16 = row.try_get("priority").map_err(get_err)?;
    let payload: Json<Payload> = row.try_get("payload").map_err(get_err)?;
    let result: Option<Json<Payload>> = row.try_get("result").map_err(get_err)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(get_err)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(get_err)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(get_err)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(get_err)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(get_err)?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(get_err)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(get_err)?;
    let version: i64 = row.try_get("version").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        name: row.try_get("name").map_err(get_err)?,
        job_type: job_type
            .parse()
            .map_err(|e| StoreError::Storage(format!("bad job type in jobs table: {e}")))?,
        status: status
            .parse()
            .map_err(|e| StoreError::Storage(format!("bad status in jobs table: {e}")))?,
        priority: u8::try_from(priority)
            .map_err(|_| StoreError::Storage(format!("priority out of range: {priority}")))?,
        payload: payload.0,
        result: result.map(|r| r.0),
        error_message: row.try_get("error_message").map_err(get_err)?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        created_at,
        updated_at,
        started_at,
        completed_at,
        worker_id: worker_id.map(WorkerId::new),
        version: version.max(0) as u64,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<Job, StoreError> {
        self.runtime.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.get_job(job_id))
    }

    fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, StoreError> {
        self.runtime.block_on(self.update_job(job, expected))
    }

    fn list(&self, query: &JobQuery, page: PageRequest) -> Result<Page<Job>, StoreError> {
        self.runtime.block_on(self.list_jobs(query, page))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.runtime.block_on(self.job_stats())
    }
}
