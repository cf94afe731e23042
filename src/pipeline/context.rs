//! The run context: everything the orchestrator accumulates across stages.
//!
//! The orchestrator owns the context exclusively. Stages receive a mutable
//! borrow but only touch it through the narrow surface below: record a
//! timing, register an artifact, store a stage payload. External clients
//! never see run state.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    filters::OcrPages,
    prelude::*,
    validator::{DocTypeCheck, Extraction},
};

/// The pipeline's stages, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Acquire,
    Ocr,
    DocTypeCheck,
    Extract,
    ValidateAndFinalize,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Ocr => "ocr",
            Stage::DocTypeCheck => "doc_type_check",
            Stage::Extract => "extract",
            Stage::ValidateAndFinalize => "validate_and_finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the document comes from.
#[derive(Debug)]
pub enum RunSource {
    /// Raw bytes from a multipart upload.
    Upload { file_name: String, bytes: Vec<u8> },
    /// A key in the configured object-store bucket.
    ObjectStore { key: String },
}

/// One pipeline invocation's input.
#[derive(Debug)]
pub struct RunRequest {
    pub declared_fio: String,
    pub external_request_id: Option<i64>,
    pub iin: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub second_name: Option<String>,
    pub source: RunSource,
    pub trace_id: String,
}

/// The run context, created at `acquire` and finalized exactly once.
pub struct RunContext {
    pub run_id: String,
    pub trace_id: String,
    pub request: RunRequest,
    pub started_at: DateTime<Utc>,
    started: Instant,

    /// Per-run scratch space; removed on drop, on every exit path.
    work_dir: TempDir,
    stage_timings: Vec<(Stage, Duration)>,
    artifacts: Vec<(String, PathBuf)>,

    // Stage payloads, filled in as stages succeed.
    pub original_file_name: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub page_count: Option<usize>,
    pub acquired_pdf: Option<PathBuf>,
    pub ocr_pages: Option<OcrPages>,
    pub doc_type_check: Option<DocTypeCheck>,
    pub extraction: Option<Extraction>,
}

impl RunContext {
    /// Create the context, assigning a fresh globally-unique run id.
    pub fn new(request: RunRequest, work_root: Option<&Path>) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let mut builder = tempfile::Builder::new();
        builder.prefix("docverify-run-");
        let work_dir = match work_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("failed to create run working directory")?;
        Ok(Self {
            trace_id: request.trace_id.clone(),
            run_id,
            request,
            started_at: Utc::now(),
            started: Instant::now(),
            work_dir,
            stage_timings: Vec::new(),
            artifacts: Vec::new(),
            original_file_name: None,
            file_size_bytes: None,
            page_count: None,
            acquired_pdf: None,
            ocr_pages: None,
            doc_type_check: None,
            extraction: None,
        })
    }

    /// A path inside the run's working directory.
    pub fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.path().join(name)
    }

    pub fn record_timing(&mut self, stage: Stage, elapsed: Duration) {
        self.stage_timings.push((stage, elapsed));
    }

    pub fn add_artifact(&mut self, name: impl Into<String>, path: PathBuf) {
        self.artifacts.push((name.into(), path));
    }

    /// Total wall-clock runtime so far, from a monotonic clock.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Stage timings as JSON, for the result artifact.
    pub fn timings_json(&self) -> Value {
        Value::Object(
            self.stage_timings
                .iter()
                .map(|(stage, elapsed)| {
                    (stage.as_str().to_owned(), json!(elapsed.as_secs_f64()))
                })
                .collect(),
        )
    }

    pub fn artifact_names(&self) -> Vec<&str> {
        self.artifacts.iter().map(|(name, _)| name.as_str()).collect()
    }
}
