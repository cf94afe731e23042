//! Persistence of verification runs.
//!
//! One immutable row per run, upserted by `run_id`. The row is the source
//! of truth for downstream auditing, so it is written on every exit path —
//! but never allowed to fail a run that already produced a verdict.

use chrono::{DateTime, NaiveDate, Utc};
use keen_retry::ExponentialJitter;
use sqlx::{PgPool, postgres::PgPoolOptions, types::Json};

use crate::{
    config::Settings,
    errors::CheckError,
    prelude::*,
    retry::{Transience, attempt, settle},
};

/// Connection-level database failures are worth another attempt; SQL and
/// constraint errors will fail the same way every time.
impl Transience for sqlx::Error {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
        )
    }
}

/// Terminal status of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    BusinessError,
    ClientError,
    ServerError,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::BusinessError => "business_error",
            RunStatus::ClientError => "client_error",
            RunStatus::ServerError => "server_error",
        }
    }
}

/// Everything persisted about one run.
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub trace_id: String,
    pub external_request_id: Option<i64>,
    pub s3_key: Option<String>,
    pub iin: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub second_name: Option<String>,
    pub declared_fio: String,
    pub original_file_name: Option<String>,
    pub file_size_bytes: Option<i64>,

    // Extracted data.
    pub doc_type: Option<String>,
    pub extracted_fio: Option<String>,
    pub doc_date: Option<NaiveDate>,
    pub organization: Option<String>,
    pub stamp_detected: Option<bool>,

    // Per-check booleans; absent when the validator never ran.
    pub fio_match: Option<bool>,
    pub doc_type_known: Option<bool>,
    pub single_doc_type: Option<bool>,
    pub doc_date_present: Option<bool>,
    pub doc_date_valid: Option<bool>,

    pub verdict: bool,
    pub status: RunStatus,
    pub errors: Vec<CheckError>,

    // System-error fields, set when status is not success/business_error.
    pub error_category: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,

    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time_seconds: f64,
}

/// Pool state for the health probe.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
}

/// Storage seam for verification runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Write the run's row; last writer wins on conflict.
    async fn upsert_run(&self, record: &RunRecord) -> Result<()>;

    /// Stamp `file_deleted_at` and drop heavyweight extracted data for
    /// rows older than `cutoff`. Returns the number of rows touched.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Connection-pool state, when the store has one.
    fn pool_status(&self) -> Option<PoolStatus>;
}

/// The Postgres-backed store.
#[derive(Clone, Debug)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Build the pool. Connections are established lazily so the service
    /// can start while the database is still coming up.
    pub fn connect(settings: &Settings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(settings.db_min_connections)
            .max_connections(settings.db_max_connections)
            .acquire_timeout(settings.db_acquire_timeout)
            .connect_lazy(&settings.database_url)
            .context("invalid database URL")?;
        Ok(Self { pool })
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run database migrations")
    }

    async fn upsert_once(&self, record: &RunRecord) -> Result<(), sqlx::Error> {
        sqlx::query(UPSERT_SQL)
            .bind(&record.run_id)
            .bind(&record.trace_id)
            .bind(record.external_request_id)
            .bind(&record.s3_key)
            .bind(&record.iin)
            .bind(&record.first_name)
            .bind(&record.last_name)
            .bind(&record.second_name)
            .bind(&record.declared_fio)
            .bind(&record.original_file_name)
            .bind(record.file_size_bytes)
            .bind(&record.doc_type)
            .bind(&record.extracted_fio)
            .bind(record.doc_date)
            .bind(&record.organization)
            .bind(record.stamp_detected)
            .bind(record.fio_match)
            .bind(record.doc_type_known)
            .bind(record.single_doc_type)
            .bind(record.doc_date_present)
            .bind(record.doc_date_valid)
            .bind(record.verdict)
            .bind(record.status.as_str())
            .bind(Json(&record.errors))
            .bind(&record.error_category)
            .bind(&record.error_code)
            .bind(&record.error_message)
            .bind(record.error_retryable)
            .bind(record.created_at)
            .bind(record.completed_at)
            .bind(record.processing_time_seconds)
            .execute(&self.pool)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    #[instrument(level = "debug", skip_all, fields(run_id = %record.run_id))]
    async fn upsert_run(&self, record: &RunRecord) -> Result<()> {
        // Transient DB errors back off exponentially: 5 attempts total,
        // starting around half a second.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 500..=8_000,
            re_attempts: 4,
            jitter_ratio: 0.2,
        };
        let resolved = attempt(self.upsert_once(record).await)
            .retry_with_async(|_| async { attempt(self.upsert_once(record).await) })
            .with_exponential_jitter(|| jitter)
            .await;
        settle(resolved)
            .with_context(|| format!("failed to persist run {}", record.run_id))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE verification_runs \
             SET file_deleted_at = NOW(), extracted_fio = NULL, organization = NULL \
             WHERE created_at < $1 AND file_deleted_at IS NULL",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("retention sweep failed")?;
        Ok(result.rows_affected())
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        })
    }
}

const UPSERT_SQL: &str = "\
INSERT INTO verification_runs (
    run_id, trace_id, external_request_id, s3_key, iin,
    first_name, last_name, second_name, declared_fio,
    original_file_name, file_size_bytes,
    doc_type, extracted_fio, doc_date, organization, stamp_detected,
    fio_match, doc_type_known, single_doc_type, doc_date_present, doc_date_valid,
    verdict, status, errors,
    error_category, error_code, error_message, error_retryable,
    created_at, completed_at, processing_time_seconds
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31
)
ON CONFLICT (run_id) DO UPDATE SET
    trace_id = EXCLUDED.trace_id,
    external_request_id = EXCLUDED.external_request_id,
    s3_key = EXCLUDED.s3_key,
    iin = EXCLUDED.iin,
    first_name = EXCLUDED.first_name,
    last_name = EXCLUDED.last_name,
    second_name = EXCLUDED.second_name,
    declared_fio = EXCLUDED.declared_fio,
    original_file_name = EXCLUDED.original_file_name,
    file_size_bytes = EXCLUDED.file_size_bytes,
    doc_type = EXCLUDED.doc_type,
    extracted_fio = EXCLUDED.extracted_fio,
    doc_date = EXCLUDED.doc_date,
    organization = EXCLUDED.organization,
    stamp_detected = EXCLUDED.stamp_detected,
    fio_match = EXCLUDED.fio_match,
    doc_type_known = EXCLUDED.doc_type_known,
    single_doc_type = EXCLUDED.single_doc_type,
    doc_date_present = EXCLUDED.doc_date_present,
    doc_date_valid = EXCLUDED.doc_date_valid,
    verdict = EXCLUDED.verdict,
    status = EXCLUDED.status,
    errors = EXCLUDED.errors,
    error_category = EXCLUDED.error_category,
    error_code = EXCLUDED.error_code,
    error_message = EXCLUDED.error_message,
    error_retryable = EXCLUDED.error_retryable,
    created_at = EXCLUDED.created_at,
    completed_at = EXCLUDED.completed_at,
    processing_time_seconds = EXCLUDED.processing_time_seconds";

/// Periodically expire old rows. Not on the request path; dies with the
/// process.
pub fn spawn_retention_janitor(
    store: Arc<dyn RunStore>,
    retention_days: i64,
    sweep_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            match store.purge_expired(cutoff).await {
                Ok(0) => debug!("retention sweep: nothing to expire"),
                Ok(rows) => info!(rows, %cutoff, "retention sweep expired rows"),
                Err(err) => warn!("retention sweep failed: {:#}", err),
            }
        }
    })
}
