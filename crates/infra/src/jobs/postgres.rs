//! Postgres-backed job store.
//!
//! ## Schema
//!
//! `migrate()` creates two tables:
//!
//! - `jobforge_jobs`: one row per job. Retry bookkeeping (`errors`) and the
//!   uniqueness strategy are JSONB; durations are stored as milliseconds.
//! - `jobforge_queues`: one row per configured queue.
//!
//! A partial unique index on `unique_digest` restricted to alive states is what
//! enforces "one alive job per digest" across all workers.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `DuplicateJob` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / decode | N/A | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use jobforge_core::{
    BackoffStrategy, ErrorRecord, JobId, JobRecord, JobState, QueueConfig, QueueState,
    UniquenessConfig, WorkerId,
};

use super::store::{JobCounts, JobStore, JobStoreError};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobforge_jobs (
        id BIGSERIAL PRIMARY KEY,
        queue TEXT NOT NULL,
        state TEXT NOT NULL,
        class TEXT NOT NULL,
        args JSONB NOT NULL DEFAULT '[]'::jsonb,
        constructor_args JSONB NOT NULL DEFAULT '[]'::jsonb,
        attempt INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        inserted_at TIMESTAMPTZ NOT NULL,
        available_at TIMESTAMPTZ,
        attempted_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        canceled_at TIMESTAMPTZ,
        claimed_at TIMESTAMPTZ,
        claimed_by TEXT,
        timeout_ms BIGINT,
        result JSONB,
        errors JSONB NOT NULL DEFAULT '[]'::jsonb,
        unique_digest TEXT,
        uniqueness_config JSONB,
        backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
        retry_delay_ms BIGINT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobforge_jobs_alive_digest
        ON jobforge_jobs (unique_digest)
        WHERE unique_digest IS NOT NULL AND state IN ('waiting', 'claimed', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobforge_jobs_claimable
        ON jobforge_jobs (queue, inserted_at, id)
        WHERE state = 'waiting'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobforge_queues (
        name TEXT PRIMARY KEY,
        concurrency INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        state TEXT NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = r#"
    id, queue, state, class, args, constructor_args, attempt, max_attempts,
    inserted_at, available_at, attempted_at, completed_at, failed_at, canceled_at,
    claimed_at, claimed_by, timeout_ms, result, errors, unique_digest,
    uniqueness_config, backoff_strategy, retry_delay_ms
"#;

/// Postgres-backed job store.
///
/// Claims run as a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP
/// LOCKED)` statement, so concurrent dispatchers never claim the same row and
/// never block on each other's locked rows.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(queue = %job.queue, class = %job.class, job_id = tracing::field::Empty),
        err
    )]
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        let row = JobRow::from_record(&job)?;
        let sql = format!(
            r#"
            INSERT INTO jobforge_jobs (
                queue, state, class, args, constructor_args, attempt, max_attempts,
                inserted_at, available_at, attempted_at, completed_at, failed_at, canceled_at,
                claimed_at, claimed_by, timeout_ms, result, errors, unique_digest,
                uniqueness_config, backoff_strategy, retry_delay_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let inserted = sqlx::query(&sql)
            .bind(&row.queue)
            .bind(&row.state)
            .bind(&row.class)
            .bind(&row.args)
            .bind(&row.constructor_args)
            .bind(row.attempt)
            .bind(row.max_attempts)
            .bind(row.inserted_at)
            .bind(row.available_at)
            .bind(row.attempted_at)
            .bind(row.completed_at)
            .bind(row.failed_at)
            .bind(row.canceled_at)
            .bind(row.claimed_at)
            .bind(&row.claimed_by)
            .bind(row.timeout_ms)
            .bind(&row.result)
            .bind(&row.errors)
            .bind(&row.unique_digest)
            .bind(&row.uniqueness_config)
            .bind(&row.backoff_strategy)
            .bind(row.retry_delay_ms)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_write_error("insert_job", e, job.unique_digest.as_deref()))?;

        let record = JobRow::from_row(&inserted)?.into_record()?;
        Span::current().record("job_id", record.id.get());
        Ok(record)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobforge_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| JobRow::from_row(&r)?.into_record()).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state), err)]
    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        let row = JobRow::from_record(job)?;
        let sql = format!(
            r#"
            UPDATE jobforge_jobs SET
                queue = $2, state = $3, attempt = $4, max_attempts = $5,
                available_at = $6, attempted_at = $7, completed_at = $8, failed_at = $9,
                canceled_at = $10, claimed_at = $11, claimed_by = $12, result = $13,
                errors = $14, unique_digest = $15
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );

        let updated = sqlx::query(&sql)
            .bind(job.id.get())
            .bind(&row.queue)
            .bind(&row.state)
            .bind(row.attempt)
            .bind(row.max_attempts)
            .bind(row.available_at)
            .bind(row.attempted_at)
            .bind(row.completed_at)
            .bind(row.failed_at)
            .bind(row.canceled_at)
            .bind(row.claimed_at)
            .bind(&row.claimed_by)
            .bind(&row.result)
            .bind(&row.errors)
            .bind(&row.unique_digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_write_error("update_job", e, job.unique_digest.as_deref()))?
            .ok_or(JobStoreError::NotFound(job.id))?;

        JobRow::from_row(&updated)?.into_record()
    }

    #[instrument(skip(self, worker), fields(worker = %worker, claimed = tracing::field::Empty), err)]
    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker: &WorkerId,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE jobforge_jobs SET
                state = 'claimed',
                claimed_at = $3,
                claimed_by = $4
            WHERE id IN (
                SELECT id FROM jobforge_jobs
                WHERE queue = $1
                  AND state = 'waiting'
                  AND (available_at IS NULL OR available_at <= $3)
                ORDER BY inserted_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(queue)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(Utc::now())
            .bind(worker.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_jobs", e))?;

        let mut jobs = rows
            .iter()
            .map(|r| JobRow::from_row(r)?.into_record())
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by_key(|j| (j.inserted_at, j.id));

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn get_queue_config(&self, name: &str) -> Result<Option<QueueConfig>, JobStoreError> {
        let row = sqlx::query(
            "SELECT name, concurrency, priority, state FROM jobforge_queues WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_queue_config", e))?;

        row.as_ref().map(queue_from_row).transpose()
    }

    #[instrument(skip(self, config), fields(queue = %config.name), err)]
    async fn upsert_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        let concurrency = i32::try_from(config.concurrency).map_err(|_| {
            JobStoreError::Storage(format!("concurrency {} out of range", config.concurrency))
        })?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobforge_queues (name, concurrency, priority, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                concurrency = EXCLUDED.concurrency,
                priority = EXCLUDED.priority,
                state = EXCLUDED.state
            RETURNING name, concurrency, priority, state
            "#,
        )
        .bind(&config.name)
        .bind(concurrency)
        .bind(config.priority)
        .bind(config.state.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_queue_config", e))?;

        queue_from_row(&row)
    }

    #[instrument(skip(self, config), fields(queue = %config.name), err)]
    async fn create_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        let concurrency = i32::try_from(config.concurrency).map_err(|_| {
            JobStoreError::Storage(format!("concurrency {} out of range", config.concurrency))
        })?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobforge_queues (name, concurrency, priority, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            RETURNING name, concurrency, priority, state
            "#,
        )
        .bind(&config.name)
        .bind(concurrency)
        .bind(config.priority)
        .bind(config.state.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_queue_config", e))?;

        match row {
            Some(row) => queue_from_row(&row),
            // Another process created it first; keep theirs.
            None => self
                .get_queue_config(&config.name)
                .await?
                .ok_or_else(|| JobStoreError::QueueNotFound(config.name.clone())),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_queue_configs(&self) -> Result<Vec<QueueConfig>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT name, concurrency, priority, state FROM jobforge_queues ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_queue_configs", e))?;

        rows.iter().map(queue_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_distinct_queues(&self) -> Result<Vec<String>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT queue FROM jobforge_jobs
            WHERE state = 'waiting' AND (available_at IS NULL OR available_at <= $1)
            ORDER BY queue ASC
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_distinct_queues", e))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("queue").map_err(|e| map_sqlx_error("decode_queue", e)))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn find_stale(
        &self,
        max_stale: Duration,
        max_claimed: Duration,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobforge_jobs
            WHERE (
                state = 'running'
                AND attempted_at < $1::timestamptz
                    - make_interval(secs => COALESCE(timeout_ms, $2::bigint) / 1000.0)
            ) OR (
                state = 'claimed'
                AND claimed_at < $1::timestamptz - make_interval(secs => $3::bigint / 1000.0)
            )
            ORDER BY id ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(millis(max_stale))
            .bind(millis(max_claimed))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_stale", e))?;

        rows.iter().map(|r| JobRow::from_row(r)?.into_record()).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobforge_jobs
            WHERE state IN ('completed', 'failed', 'canceled')
              AND COALESCE(completed_at, failed_at, canceled_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_finished_before", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn count_by_state(&self, queue: Option<&str>) -> Result<JobCounts, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS n FROM jobforge_jobs
            WHERE ($1::text IS NULL OR queue = $1)
            GROUP BY state
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_state", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("decode_count", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("decode_count", e))?;
            counts.add(parse_state(&state)?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {} (code {})",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Like [`map_sqlx_error`], but unique violations become `DuplicateJob`.
fn map_write_error(operation: &str, err: sqlx::Error, digest: Option<&str>) -> JobStoreError {
    if is_unique_violation(&err) {
        return JobStoreError::DuplicateJob {
            digest: digest.unwrap_or_default().to_string(),
        };
    }
    map_sqlx_error(operation, err)
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_state(s: &str) -> Result<JobState, JobStoreError> {
    s.parse()
        .map_err(|e| JobStoreError::Storage(format!("invalid job state in row: {e}")))
}

fn decode_error(what: &str, err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode {what}: {err}"))
}

/// Negative values are corrupt rows, not "unlimited".
fn decode_concurrency(value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|e| decode_error("concurrency", format!("{value}: {e}")))
}

fn queue_from_row(row: &PgRow) -> Result<QueueConfig, JobStoreError> {
    let name: String = row.try_get("name").map_err(|e| decode_error("queue name", e))?;
    let concurrency: i32 = row.try_get("concurrency").map_err(|e| decode_error("concurrency", e))?;
    let priority: i32 = row.try_get("priority").map_err(|e| decode_error("priority", e))?;
    let state: String = row.try_get("state").map_err(|e| decode_error("queue state", e))?;

    Ok(QueueConfig {
        name,
        concurrency: decode_concurrency(concurrency)?,
        priority,
        state: state
            .parse::<QueueState>()
            .map_err(|e| decode_error("queue state", e))?,
    })
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    queue: String,
    state: String,
    class: String,
    args: serde_json::Value,
    constructor_args: serde_json::Value,
    attempt: i32,
    max_attempts: i32,
    inserted_at: DateTime<Utc>,
    available_at: Option<DateTime<Utc>>,
    attempted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    timeout_ms: Option<i64>,
    result: Option<serde_json::Value>,
    errors: serde_json::Value,
    unique_digest: Option<String>,
    uniqueness_config: Option<serde_json::Value>,
    backoff_strategy: String,
    retry_delay_ms: Option<i64>,
}

impl JobRow {
    fn from_row(row: &PgRow) -> Result<Self, JobStoreError> {
        let decode = |e: sqlx::Error| decode_error("job row", e);
        Ok(JobRow {
            id: row.try_get("id").map_err(decode)?,
            queue: row.try_get("queue").map_err(decode)?,
            state: row.try_get("state").map_err(decode)?,
            class: row.try_get("class").map_err(decode)?,
            args: row.try_get("args").map_err(decode)?,
            constructor_args: row.try_get("constructor_args").map_err(decode)?,
            attempt: row.try_get("attempt").map_err(decode)?,
            max_attempts: row.try_get("max_attempts").map_err(decode)?,
            inserted_at: row.try_get("inserted_at").map_err(decode)?,
            available_at: row.try_get("available_at").map_err(decode)?,
            attempted_at: row.try_get("attempted_at").map_err(decode)?,
            completed_at: row.try_get("completed_at").map_err(decode)?,
            failed_at: row.try_get("failed_at").map_err(decode)?,
            canceled_at: row.try_get("canceled_at").map_err(decode)?,
            claimed_at: row.try_get("claimed_at").map_err(decode)?,
            claimed_by: row.try_get("claimed_by").map_err(decode)?,
            timeout_ms: row.try_get("timeout_ms").map_err(decode)?,
            result: row.try_get("result").map_err(decode)?,
            errors: row.try_get("errors").map_err(decode)?,
            unique_digest: row.try_get("unique_digest").map_err(decode)?,
            uniqueness_config: row.try_get("uniqueness_config").map_err(decode)?,
            backoff_strategy: row.try_get("backoff_strategy").map_err(decode)?,
            retry_delay_ms: row.try_get("retry_delay_ms").map_err(decode)?,
        })
    }

    fn from_record(job: &JobRecord) -> Result<Self, JobStoreError> {
        let int = |what: &str, v: u32| {
            i32::try_from(v).map_err(|_| JobStoreError::Storage(format!("{what} {v} out of range")))
        };

        Ok(JobRow {
            id: job.id.get(),
            queue: job.queue.clone(),
            state: job.state.as_str().to_string(),
            class: job.class.clone(),
            args: serde_json::Value::Array(job.args.clone()),
            constructor_args: serde_json::Value::Array(job.constructor_args.clone()),
            attempt: int("attempt", job.attempt)?,
            max_attempts: int("max_attempts", job.max_attempts)?,
            inserted_at: job.inserted_at,
            available_at: job.available_at,
            attempted_at: job.attempted_at,
            completed_at: job.completed_at,
            failed_at: job.failed_at,
            canceled_at: job.canceled_at,
            claimed_at: job.claimed_at,
            claimed_by: job.claimed_by.clone(),
            timeout_ms: job.timeout.map(millis),
            result: job.result.clone(),
            errors: to_json("errors", &job.errors)?,
            unique_digest: job.unique_digest.clone(),
            uniqueness_config: job
                .uniqueness_config
                .as_ref()
                .map(|c| to_json("uniqueness_config", c))
                .transpose()?,
            backoff_strategy: job.backoff_strategy.as_str().to_string(),
            retry_delay_ms: job.retry_delay.map(millis),
        })
    }

    fn into_record(self) -> Result<JobRecord, JobStoreError> {
        let list = |what: &str, v: serde_json::Value| match v {
            serde_json::Value::Array(items) => Ok(items),
            other => Err(decode_error(what, format!("expected array, got {other}"))),
        };
        let duration = |ms: Option<i64>| ms.map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0)));

        let errors: Vec<ErrorRecord> =
            serde_json::from_value(self.errors).map_err(|e| decode_error("errors", e))?;
        let uniqueness_config: Option<UniquenessConfig> = self
            .uniqueness_config
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| decode_error("uniqueness_config", e))?;
        let backoff_strategy: BackoffStrategy = self
            .backoff_strategy
            .parse()
            .map_err(|e| decode_error("backoff_strategy", e))?;

        Ok(JobRecord {
            id: JobId::new(self.id),
            queue: self.queue,
            state: parse_state(&self.state)?,
            class: self.class,
            args: list("args", self.args)?,
            constructor_args: list("constructor_args", self.constructor_args)?,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            max_attempts: u32::try_from(self.max_attempts).unwrap_or(1),
            inserted_at: self.inserted_at,
            available_at: self.available_at,
            attempted_at: self.attempted_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            canceled_at: self.canceled_at,
            claimed_at: self.claimed_at,
            claimed_by: self.claimed_by,
            timeout: duration(self.timeout_ms),
            result: self.result,
            errors,
            unique_digest: self.unique_digest,
            uniqueness_config,
            backoff_strategy,
            retry_delay: duration(self.retry_delay_ms),
        })
    }
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("failed to encode {what}: {e}")))
}

#[cfg(test)]
mod tests {
    //! Require a running PostgreSQL; run with
    //! `DATABASE_URL=postgres://... cargo test -p jobforge-infra -- --ignored`.

    use super::*;
    use jobforge_core::{NewJob, Transition};
    use serde_json::json;

    async fn store() -> PostgresJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PostgresJobStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn unique_queue(prefix: &str) -> String {
        format!("{prefix}-{}", WorkerId::generate())
    }

    #[tokio::test]
    #[ignore]
    async fn insert_claim_update_round_trip() {
        let store = store().await;
        let queue = unique_queue("pg-roundtrip");
        let worker = WorkerId::new("pg-test");

        let job = NewJob::new("send_email")
            .queue(&queue)
            .arg(json!({"to": "a@example.com"}))
            .timeout(Duration::from_secs(5))
            .into_record(Utc::now())
            .unwrap();
        let inserted = store.insert(job).await.unwrap();

        let claimed = store.claim(&queue, 10, &worker).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, inserted.id);
        assert_eq!(claimed[0].state, JobState::Claimed);

        let running = Transition::Run.apply_now(claimed[0].clone());
        let failed = Transition::retry("boom").apply_now(running);
        let persisted = store.update(&failed).await.unwrap();
        assert_eq!(persisted.errors.len(), 1);
        assert_eq!(persisted.timeout, Some(Duration::from_secs(5)));
        assert_eq!(persisted.args, vec![json!({"to": "a@example.com"})]);
    }

    #[tokio::test]
    #[ignore]
    async fn alive_digest_collision_maps_to_duplicate_job() {
        let store = store().await;
        let queue = unique_queue("pg-unique");
        let job = || {
            NewJob::new("sync")
                .queue(&queue)
                .arg(json!(queue.clone()))
                .unique(UniquenessConfig::alive(true))
                .into_record(Utc::now())
                .unwrap()
        };

        store.insert(job()).await.unwrap();
        let err = store.insert(job()).await.unwrap_err();
        assert!(matches!(err, JobStoreError::DuplicateJob { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn queue_config_upsert_round_trips() {
        let store = store().await;
        let name = unique_queue("pg-config");
        let config = QueueConfig::new(&name)
            .with_concurrency(3)
            .with_priority(9)
            .with_state(QueueState::Paused);

        store.upsert_queue_config(&config).await.unwrap();
        assert_eq!(store.get_queue_config(&name).await.unwrap(), Some(config));
    }

    #[tokio::test]
    #[ignore]
    async fn create_queue_config_keeps_an_existing_row() {
        let store = store().await;
        let name = unique_queue("pg-create");
        let paused = QueueConfig::new(&name).with_state(QueueState::Paused);

        assert_eq!(store.create_queue_config(&paused).await.unwrap(), paused);
        let kept = store.create_queue_config(&QueueConfig::new(&name)).await.unwrap();
        assert_eq!(kept, paused);
    }

    #[test]
    fn negative_concurrency_is_a_decode_error() {
        assert_eq!(decode_concurrency(0).unwrap(), 0);
        assert_eq!(decode_concurrency(4).unwrap(), 4);

        let err = decode_concurrency(-1).unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(ref msg) if msg.contains("concurrency")));
    }
}
