//! Process configuration, read from the environment at startup.
//!
//! Every external endpoint, credential, limit and feature flag lives here.
//! Values may come from a standard `.env` file in development; nothing is
//! committed to source.

use std::env;
use std::str::FromStr;

use crate::prelude::*;

/// All runtime settings, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Address the HTTP server binds to.
    pub bind_addr: String,

    // OCR service.
    pub ocr_base_url: String,
    pub ocr_poll_interval: Duration,
    pub ocr_poll_deadline: Duration,
    pub ocr_request_timeout: Duration,
    pub ocr_max_concurrency: usize,

    // LLM service. `llm_endpoint` is the full completion URL.
    pub llm_endpoint: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_request_timeout: Duration,

    // Circuit breakers (shared parameters for all guarded services).
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,

    // Object store.
    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_bucket: String,
    pub s3_verify_tls: bool,

    // Database.
    pub database_url: String,
    pub db_min_connections: u32,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,

    // Pipeline limits.
    pub run_deadline: Duration,
    pub max_pdf_pages: usize,
    pub max_upload_bytes: usize,
    pub image_dpi: u32,
    pub shutdown_drain: Duration,

    // Prompt templates.
    pub prompt_dir: PathBuf,
    pub doc_type_prompt_version: String,
    pub extract_prompt_version: String,

    // Retention.
    pub runs_retention_days: i64,
    pub retention_sweep_interval: Duration,

    // Feature flags.
    pub write_artifacts: bool,
    pub stamp_detection_enabled: bool,

    /// Where the per-run `result.json` artifacts land. Unlike the run
    /// working directory, these survive the run.
    pub artifacts_dir: PathBuf,

    /// Root for per-run working directories. Defaults to the system
    /// temp dir.
    pub work_dir: Option<PathBuf>,
}

/// Read an environment variable, falling back to `default` when unset,
/// and failing loudly when set to something unparsable.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("invalid value for {}: {}", key, err)),
        Err(_) => Ok(default),
    }
}

/// Read a required environment variable.
fn env_required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| anyhow!("missing required environment variable {}", key))
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

impl Settings {
    /// Load settings from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: env_parse("DOCVERIFY_BIND", "0.0.0.0:8080".to_owned())?,

            ocr_base_url: env_required("OCR_BASE_URL")?,
            ocr_poll_interval: env_secs("OCR_POLL_INTERVAL_SECS", 2)?,
            ocr_poll_deadline: env_secs("OCR_POLL_DEADLINE_SECS", 300)?,
            ocr_request_timeout: env_secs("OCR_REQUEST_TIMEOUT_SECS", 60)?,
            ocr_max_concurrency: env_parse("OCR_MAX_CONCURRENCY", 5)?,

            llm_endpoint: env_required("LLM_ENDPOINT")?,
            llm_model: env_parse("LLM_MODEL", "gpt-4o".to_owned())?,
            llm_temperature: env_parse("LLM_TEMPERATURE", 0.0)?,
            llm_max_tokens: env_parse("LLM_MAX_TOKENS", 2000)?,
            llm_request_timeout: env_secs("LLM_REQUEST_TIMEOUT_SECS", 30)?,

            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_cooldown: env_secs("BREAKER_COOLDOWN_SECS", 30)?,

            s3_endpoint: env_parse("S3_ENDPOINT", String::new())?,
            // The signature requires a non-empty region string; the server
            // does not validate its value.
            s3_region: env_parse("S3_REGION", "us-east-1".to_owned())?,
            s3_access_key: env_parse("S3_ACCESS_KEY", String::new())?,
            s3_secret_key: env_parse("S3_SECRET_KEY", String::new())?,
            s3_bucket: env_parse("S3_BUCKET", String::new())?,
            s3_verify_tls: env_parse("S3_VERIFY_TLS", true)?,

            database_url: env_parse("DATABASE_URL", String::new())?,
            db_min_connections: env_parse("DB_MIN_CONNECTIONS", 2)?,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 10)?,
            db_acquire_timeout: env_secs("DB_ACQUIRE_TIMEOUT_SECS", 10)?,

            run_deadline: env_secs("RUN_DEADLINE_SECS", 120)?,
            max_pdf_pages: env_parse("MAX_PDF_PAGES", 3)?,
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 50 * 1024 * 1024)?,
            image_dpi: env_parse("IMAGE_DPI", 300)?,
            shutdown_drain: env_secs("SHUTDOWN_DRAIN_SECS", 30)?,

            prompt_dir: PathBuf::from(env_parse(
                "PROMPT_DIR",
                "prompts".to_owned(),
            )?),
            doc_type_prompt_version: env_parse(
                "DOC_TYPE_PROMPT_VERSION",
                "v1".to_owned(),
            )?,
            extract_prompt_version: env_parse(
                "EXTRACT_PROMPT_VERSION",
                "v1".to_owned(),
            )?,

            runs_retention_days: env_parse("RUNS_RETENTION_DAYS", 30)?,
            retention_sweep_interval: env_secs(
                "RETENTION_SWEEP_INTERVAL_SECS",
                24 * 60 * 60,
            )?,

            write_artifacts: env_parse("WRITE_ARTIFACTS", true)?,
            stamp_detection_enabled: env_parse("STAMP_DETECTION_ENABLED", false)?,
            artifacts_dir: PathBuf::from(env_parse(
                "ARTIFACTS_DIR",
                "artifacts".to_owned(),
            )?),

            work_dir: env::var("WORK_DIR").ok().map(PathBuf::from),
        })
    }

    /// A settings value suitable for tests: local doubles, tiny timeouts.
    pub fn for_tests(ocr_base_url: String, llm_endpoint: String) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_owned(),
            ocr_base_url,
            ocr_poll_interval: Duration::from_millis(10),
            ocr_poll_deadline: Duration::from_secs(5),
            ocr_request_timeout: Duration::from_secs(5),
            ocr_max_concurrency: 5,
            llm_endpoint,
            llm_model: "test-model".to_owned(),
            llm_temperature: 0.0,
            llm_max_tokens: 2000,
            llm_request_timeout: Duration::from_secs(5),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(30),
            s3_endpoint: "http://127.0.0.1:9000".to_owned(),
            s3_region: "us-east-1".to_owned(),
            s3_access_key: "test".to_owned(),
            s3_secret_key: "test".to_owned(),
            s3_bucket: "documents".to_owned(),
            s3_verify_tls: true,
            database_url: String::new(),
            db_min_connections: 2,
            db_max_connections: 10,
            db_acquire_timeout: Duration::from_secs(10),
            run_deadline: Duration::from_secs(30),
            max_pdf_pages: 3,
            max_upload_bytes: 50 * 1024 * 1024,
            image_dpi: 300,
            shutdown_drain: Duration::from_secs(30),
            prompt_dir: PathBuf::from("prompts"),
            doc_type_prompt_version: "v1".to_owned(),
            extract_prompt_version: "v1".to_owned(),
            runs_retention_days: 30,
            retention_sweep_interval: Duration::from_secs(24 * 60 * 60),
            write_artifacts: true,
            stamp_detection_enabled: false,
            artifacts_dir: std::env::temp_dir().join("docverify-test-artifacts"),
            work_dir: None,
        }
    }
}
