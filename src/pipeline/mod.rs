//! The verification pipeline: a fixed sequence of stages over an owned run
//! context, finalized exactly once.
//!
//! Stage order: `acquire`, `ocr`, `doc_type_check`, `extract`,
//! `validate_and_finalize`. Any typed failure short-circuits to
//! finalization; business-rule failures are not errors and flow through the
//! validator's outcome. Whatever happens, exactly one persistence row is
//! written per run.

pub mod acquire;
pub mod context;

use std::time::Instant;

use chrono::Utc;
use tokio::{fs, time};

use crate::{
    errors::{CheckError, ErrorCategory, ErrorCode, PipelineError},
    filters,
    prelude::*,
    prompts::PromptTemplate,
    server::AppState,
    store::{RunRecord, RunStatus},
    validator::{self, DocTypeCheck, Extraction, MergedDocument, ValidationOutcome},
    validity,
};

pub use context::{RunContext, RunRequest, RunSource, Stage};

/// The business response returned for every finalized run that produced a
/// verdict (true or false).
#[derive(Clone, Debug, Serialize)]
pub struct VerifyResponse {
    pub run_id: String,
    pub verdict: bool,
    pub errors: Vec<CheckError>,
    pub processing_time_seconds: f64,
}

/// JSON Schema for the doc-type classification payload.
pub fn doc_type_check_schema() -> Value {
    json!({
        "type": "object",
        "required": ["doc_type", "single_doc_type_valid"],
        "properties": {
            "doc_type": {"type": ["string", "null"]},
            "single_doc_type_valid": {"type": "boolean"},
        },
    })
}

/// JSON Schema for the field-extraction payload.
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "fio": {"type": ["string", "null"]},
            "doc_date": {"type": ["string", "null"]},
            "organization": {"type": ["string", "null"]},
        },
    })
}

/// Execute one run end-to-end and persist its row.
///
/// On success the caller gets the business response; on failure the typed
/// error, after the row has been written. The whole run is bounded by the
/// configured deadline.
#[instrument(level = "info", skip_all, fields(trace_id = %request.trace_id))]
pub async fn execute(
    state: &AppState,
    request: RunRequest,
) -> Result<VerifyResponse, PipelineError> {
    let mut ctx = RunContext::new(request, state.settings.work_dir.as_deref())
        .map_err(|err| {
            PipelineError::new(
                ErrorCode::FileSaveFailed,
                "failed to create run working directory",
            )
            .with_cause(err)
        })?;
    info!(run_id = %ctx.run_id, "run started");

    let deadline = state.settings.run_deadline;
    let outcome = match time::timeout(deadline, run_stages(state, &mut ctx)).await {
        Ok(result) => result,
        // Deadline expiry aborts the in-flight stage; dropping its future
        // aborts any outstanding HTTP request with it.
        Err(_) => Err(PipelineError::new(
            ErrorCode::RequestTimeout,
            format!("run exceeded the {}s deadline", deadline.as_secs()),
        )),
    };

    finalize(state, ctx, outcome).await
}

/// The stage sequence, as straight-line code.
async fn run_stages(
    state: &AppState,
    ctx: &mut RunContext,
) -> Result<ValidationOutcome, PipelineError> {
    let started = Instant::now();
    let result = acquire::run(state, ctx).await;
    ctx.record_timing(Stage::Acquire, started.elapsed());
    checked(ctx, Stage::Acquire, result)?;

    let started = Instant::now();
    let result = stage_ocr(state, ctx).await;
    ctx.record_timing(Stage::Ocr, started.elapsed());
    checked(ctx, Stage::Ocr, result)?;

    let started = Instant::now();
    let result = stage_doc_type_check(state, ctx).await;
    ctx.record_timing(Stage::DocTypeCheck, started.elapsed());
    checked(ctx, Stage::DocTypeCheck, result)?;

    let started = Instant::now();
    let result = stage_extract(state, ctx).await;
    ctx.record_timing(Stage::Extract, started.elapsed());
    checked(ctx, Stage::Extract, result)?;

    let started = Instant::now();
    let outcome = stage_validate(state, ctx);
    ctx.record_timing(Stage::ValidateAndFinalize, started.elapsed());
    Ok(outcome)
}

/// Log a stage failure with full correlation fields before propagating it.
fn checked(
    ctx: &RunContext,
    stage: Stage,
    result: Result<(), PipelineError>,
) -> Result<(), PipelineError> {
    if let Err(err) = &result {
        warn!(
            run_id = %ctx.run_id,
            trace_id = %ctx.trace_id,
            stage = stage.as_str(),
            code = err.code.as_str(),
            category = err.category.as_str(),
            "stage failed: {}",
            err.full_detail()
        );
    }
    result
}

/// The `ocr` stage: recognize the acquired PDF and keep the filtered pages.
async fn stage_ocr(state: &AppState, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let pdf_path = ctx.acquired_pdf.clone().ok_or_else(|| {
        PipelineError::new(ErrorCode::InternalError, "acquire stage left no PDF")
    })?;
    let pdf_bytes = fs::read(&pdf_path).await.map_err(|err| {
        PipelineError::new(ErrorCode::FileSaveFailed, "failed to read acquired PDF")
            .with_cause(err.into())
    })?;

    let file_name = ctx
        .original_file_name
        .clone()
        .unwrap_or_else(|| "document.pdf".to_owned());
    let pages = state.ocr.recognize(pdf_bytes, &file_name).await?;

    if pages.is_empty() {
        return Err(PipelineError::new(
            ErrorCode::OcrEmptyPages,
            "no non-empty pages survived OCR filtering",
        ));
    }

    if state.settings.write_artifacts {
        let artifact = ctx.work_path("ocr_pages.json");
        let serialized = serde_json::to_vec_pretty(&pages).map_err(|err| {
            PipelineError::new(ErrorCode::InternalError, "failed to serialize OCR pages")
                .with_cause(err.into())
        })?;
        fs::write(&artifact, serialized).await.map_err(|err| {
            PipelineError::new(ErrorCode::FileSaveFailed, "failed to write OCR artifact")
                .with_cause(err.into())
        })?;
        ctx.add_artifact("ocr_pages", artifact);
    }

    ctx.ocr_pages = Some(pages);
    Ok(())
}

/// Call the LLM with a rendered prompt and hand back the extracted payload.
async fn llm_json_call(
    state: &AppState,
    template: &PromptTemplate,
    ctx: &RunContext,
) -> Result<Value, PipelineError> {
    let pages = ctx.ocr_pages.as_ref().ok_or_else(|| {
        PipelineError::new(ErrorCode::InternalError, "OCR stage left no pages")
    })?;
    let payload = pages.to_prompt_payload().map_err(|err| {
        PipelineError::new(ErrorCode::InternalError, "failed to build prompt payload")
            .with_cause(err)
    })?;
    let prompt = template.render(&payload);
    let envelope = state.llm.complete(&prompt).await?;
    filters::extract_llm_payload(&envelope)
}

/// The `doc_type_check` stage.
async fn stage_doc_type_check(
    state: &AppState,
    ctx: &mut RunContext,
) -> Result<(), PipelineError> {
    let payload = llm_json_call(state, &state.prompts.doc_type_check, ctx).await?;

    state.dtc_validator.validate(&payload).map_err(|err| {
        PipelineError::new(
            ErrorCode::DtcParseError,
            format!("classification payload failed schema validation: {}", err),
        )
    })?;
    let classification: DocTypeCheck =
        serde_json::from_value(payload).map_err(|err| {
            PipelineError::new(ErrorCode::DtcFailed, "unusable classification payload")
                .with_cause(err.into())
        })?;

    // A file mixing document kinds is rejected here, before extraction,
    // as a client-facing error.
    if !classification.single_doc_type_valid {
        ctx.doc_type_check = Some(classification);
        return Err(PipelineError::new(
            ErrorCode::MultipleDocuments,
            "document file contains multiple document types",
        ));
    }

    debug!(
        run_id = %ctx.run_id,
        doc_type = classification.doc_type.as_deref().unwrap_or("<unknown>"),
        "document classified"
    );
    ctx.doc_type_check = Some(classification);
    Ok(())
}

/// The `extract` stage.
async fn stage_extract(state: &AppState, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let payload = llm_json_call(state, &state.prompts.extract_fields, ctx).await?;

    state.extract_validator.validate(&payload).map_err(|err| {
        PipelineError::new(
            ErrorCode::ExtractSchemaInvalid,
            format!("extraction payload failed schema validation: {}", err),
        )
    })?;
    let extraction: Extraction = serde_json::from_value(payload).map_err(|err| {
        PipelineError::new(ErrorCode::ExtractFailed, "unusable extraction payload")
            .with_cause(err.into())
    })?;

    ctx.extraction = Some(extraction);
    Ok(())
}

/// The business-rule half of `validate_and_finalize`.
fn stage_validate(state: &AppState, ctx: &mut RunContext) -> ValidationOutcome {
    let classification = ctx.doc_type_check.clone().unwrap_or_default();
    let extraction = ctx.extraction.clone().unwrap_or_default();
    // The stamp-detection hook is disabled; the merged record keeps the
    // slot so enabling the flag has somewhere to put its result.
    let stamp_detected: Option<bool> = None;
    if state.settings.stamp_detection_enabled {
        debug!(run_id = %ctx.run_id, "stamp detection enabled but no detector is wired in");
    }
    let merged = MergedDocument::merge(classification, extraction, stamp_detected);
    validator::validate(&ctx.request.declared_fio, &merged, validity::today())
}

/// Finalize the run: compose the row, write it, emit the result artifact,
/// and shape the caller-visible outcome.
async fn finalize(
    state: &AppState,
    ctx: RunContext,
    outcome: Result<ValidationOutcome, PipelineError>,
) -> Result<VerifyResponse, PipelineError> {
    let processing_time_seconds = ctx.elapsed_seconds();
    let completed_at = Utc::now();

    let (record, response) = match outcome {
        Ok(validation) => {
            let status = if validation.verdict {
                RunStatus::Success
            } else {
                RunStatus::BusinessError
            };
            let response = VerifyResponse {
                run_id: ctx.run_id.clone(),
                verdict: validation.verdict,
                errors: validation.errors.clone(),
                processing_time_seconds,
            };
            let record = build_record(
                &ctx,
                status,
                validation.verdict,
                validation.errors.clone(),
                Some(&validation),
                None,
                completed_at,
                processing_time_seconds,
            );
            (record, Ok(response))
        }
        Err(err) => {
            let status = match err.category {
                ErrorCategory::ClientError => RunStatus::ClientError,
                _ => RunStatus::ServerError,
            };
            let errors = vec![CheckError::new(err.code)];
            let record = build_record(
                &ctx,
                status,
                false,
                errors,
                None,
                Some(&err),
                completed_at,
                processing_time_seconds,
            );
            (record, Err(err))
        }
    };

    if state.settings.write_artifacts {
        write_result_artifact(&state.settings.artifacts_dir, &ctx, &record).await;
    }

    // The row is the audit trail, but a write failure must never mask a
    // verdict the pipeline already produced.
    if let Err(err) = state.store.upsert_run(&record).await {
        error!(
            run_id = %ctx.run_id,
            trace_id = %ctx.trace_id,
            "failed to persist run: {:#}",
            err
        );
    }

    match &response {
        Ok(resp) => info!(
            run_id = %ctx.run_id,
            verdict = resp.verdict,
            status = record.status.as_str(),
            processing_time_seconds,
            "run finalized"
        ),
        Err(err) => warn!(
            run_id = %ctx.run_id,
            code = err.code.as_str(),
            category = err.category.as_str(),
            status = record.status.as_str(),
            "run finalized with failure"
        ),
    }
    response
}

/// Assemble the persistence row from whatever the run accumulated.
#[allow(clippy::too_many_arguments)]
fn build_record(
    ctx: &RunContext,
    status: RunStatus,
    verdict: bool,
    errors: Vec<CheckError>,
    validation: Option<&ValidationOutcome>,
    failure: Option<&PipelineError>,
    completed_at: chrono::DateTime<Utc>,
    processing_time_seconds: f64,
) -> RunRecord {
    let extraction = ctx.extraction.clone().unwrap_or_default();
    let doc_date = match validation {
        Some(validation) => validation.doc_date,
        None => extraction
            .doc_date
            .as_deref()
            .and_then(validity::parse_doc_date),
    };
    RunRecord {
        run_id: ctx.run_id.clone(),
        trace_id: ctx.trace_id.clone(),
        external_request_id: ctx.request.external_request_id,
        s3_key: match &ctx.request.source {
            RunSource::ObjectStore { key } => Some(key.clone()),
            RunSource::Upload { .. } => None,
        },
        iin: ctx.request.iin.clone(),
        first_name: ctx.request.first_name.clone(),
        last_name: ctx.request.last_name.clone(),
        second_name: ctx.request.second_name.clone(),
        declared_fio: ctx.request.declared_fio.clone(),
        original_file_name: ctx.original_file_name.clone(),
        file_size_bytes: ctx.file_size_bytes,
        doc_type: ctx
            .doc_type_check
            .as_ref()
            .and_then(|check| check.doc_type.clone()),
        extracted_fio: extraction.fio,
        doc_date,
        organization: extraction.organization,
        stamp_detected: None,
        fio_match: validation.map(|v| v.checks.fio_match),
        doc_type_known: validation.map(|v| v.checks.doc_type_known),
        single_doc_type: validation.map(|v| v.checks.single_doc_type),
        doc_date_present: validation.map(|v| v.checks.doc_date_present),
        doc_date_valid: validation.map(|v| v.checks.doc_date_valid),
        verdict,
        status,
        errors,
        error_category: failure.map(|err| err.category.as_str().to_owned()),
        error_code: failure.map(|err| err.code.as_str().to_owned()),
        error_message: failure.map(|err| err.full_detail()),
        error_retryable: failure.map(|err| err.retryable),
        created_at: ctx.started_at,
        completed_at,
        processing_time_seconds,
    }
}

/// Write the single structured result artifact for this run.
///
/// The run working directory disappears with the context; the result file
/// goes to the durable artifacts directory instead, named by run id.
async fn write_result_artifact(artifacts_dir: &Path, ctx: &RunContext, record: &RunRecord) {
    let artifact = json!({
        "run_id": record.run_id,
        "trace_id": record.trace_id,
        "status": record.status.as_str(),
        "verdict": record.verdict,
        "errors": record.errors,
        "processing_time_seconds": record.processing_time_seconds,
        "stage_timings": ctx.timings_json(),
        "artifacts": ctx.artifact_names(),
    });
    if let Err(err) = fs::create_dir_all(artifacts_dir).await {
        warn!(run_id = %ctx.run_id, "failed to create artifacts dir: {}", err);
        return;
    }
    let path = artifacts_dir.join(format!("{}.json", ctx.run_id));
    match serde_json::to_vec_pretty(&artifact) {
        Ok(bytes) => {
            if let Err(err) = fs::write(&path, bytes).await {
                warn!(run_id = %ctx.run_id, "failed to write result artifact: {}", err);
            }
        }
        Err(err) => {
            warn!(run_id = %ctx.run_id, "failed to serialize result artifact: {}", err);
        }
    }
}
