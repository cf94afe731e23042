//! Client for the two-phase OCR service: upload a PDF, then poll for the
//! recognized text.
//!
//! The service is treated as vendor-neutral: upload to `/v2/pdf` returns an
//! opaque identifier, and `/v2/result/{id}` is polled until a terminal
//! status appears. Concurrent calls are bounded by a process-wide
//! semaphore so a burst of runs cannot overwhelm the external service.

use core::fmt;
use std::error;
use std::time::Instant;

use keen_retry::ExponentialJitter;
use reqwest::{StatusCode, multipart};
use tokio::sync::Semaphore;
use tokio::time;

use crate::{
    breaker::CircuitBreaker,
    config::Settings,
    errors::{ErrorCode, PipelineError},
    filters::{OcrPages, filter_ocr_pages},
    prelude::*,
    retry::{Transience, attempt, retry_after, settle, transient_http_status},
};

/// Statuses that mean the OCR job finished successfully. Vendors disagree
/// on the exact word.
const DONE_STATUSES: &[&str] = &["done", "completed", "success", "finished", "ready"];

/// Statuses that mean the OCR job failed.
const FAILED_STATUSES: &[&str] = &["failed", "error"];

/// An error which occurred while talking to the OCR service.
#[derive(Debug)]
enum OcrCallError {
    /// A transport-level failure on send.
    Request(reqwest::Error),
    /// An unexpected HTTP status.
    Status(StatusCode),
    /// The response body could not be read or was not JSON.
    Body(reqwest::Error),
    /// The upload response carried no file identifier.
    MissingId,
    /// The service reported the job as failed.
    JobFailed(String),
    /// The poll deadline elapsed before a terminal status appeared.
    DeadlineExceeded,
}

impl Transience for OcrCallError {
    fn is_transient(&self) -> bool {
        match self {
            // Send-level failures carry no status, and reqwest does not
            // expose enough detail to tell a dropped connection from
            // anything else; give the network the benefit of the doubt.
            OcrCallError::Request(_) => true,
            OcrCallError::Status(status) => transient_http_status(*status),
            // A readable-but-wrong response will stay wrong on retry.
            OcrCallError::Body(_)
            | OcrCallError::MissingId
            | OcrCallError::JobFailed(_)
            | OcrCallError::DeadlineExceeded => false,
        }
    }
}

impl fmt::Display for OcrCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrCallError::Request(err) => write!(f, "OCR transport error: {}", err),
            OcrCallError::Status(status) => write!(f, "OCR returned HTTP {}", status),
            OcrCallError::Body(err) => write!(f, "OCR response body unreadable: {}", err),
            OcrCallError::MissingId => write!(f, "OCR upload response had no id"),
            OcrCallError::JobFailed(detail) => write!(f, "OCR job failed: {}", detail),
            OcrCallError::DeadlineExceeded => write!(f, "OCR poll deadline exceeded"),
        }
    }
}

impl error::Error for OcrCallError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            OcrCallError::Request(err) | OcrCallError::Body(err) => Some(err),
            _ => None,
        }
    }
}

/// Client for the OCR service.
#[derive(Debug)]
pub struct OcrClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    poll_deadline: Duration,
    breaker: Arc<CircuitBreaker>,
    semaphore: Arc<Semaphore>,
}

impl OcrClient {
    pub fn new(settings: &Settings, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.ocr_request_timeout)
            .build()
            .context("failed to build OCR HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.ocr_base_url.trim_end_matches('/').to_owned(),
            poll_interval: settings.ocr_poll_interval,
            poll_deadline: settings.ocr_poll_deadline,
            breaker,
            semaphore: Arc::new(Semaphore::new(settings.ocr_max_concurrency)),
        })
    }

    /// Run a document through OCR and return the filtered pages.
    #[instrument(level = "debug", skip_all, fields(file_name = %file_name))]
    pub async fn recognize(
        &self,
        pdf_bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<OcrPages, PipelineError> {
        self.breaker.try_acquire().map_err(|cooldown| {
            PipelineError::new(ErrorCode::ServiceUnavailable, "OCR circuit breaker open")
                .with_retry_after(cooldown)
        })?;

        let _permit = self.semaphore.acquire().await.map_err(|_| {
            PipelineError::new(ErrorCode::InternalError, "OCR semaphore closed")
        })?;

        let result = self.recognize_inner(pdf_bytes, file_name).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result.map_err(|err| {
            let code = match &err {
                OcrCallError::DeadlineExceeded => ErrorCode::OcrTimeout,
                _ => ErrorCode::OcrFailed,
            };
            PipelineError::new(code, err.to_string()).with_cause(anyhow!("{}", err))
        })
    }

    async fn recognize_inner(
        &self,
        pdf_bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<OcrPages, OcrCallError> {
        let file_id = self.upload(pdf_bytes, file_name).await?;
        debug!(file_id = %file_id, "OCR upload accepted");
        self.poll(&file_id).await
    }

    /// Upload the PDF, retrying transient failures with backoff.
    async fn upload(&self, pdf_bytes: Vec<u8>, file_name: &str) -> Result<String, OcrCallError> {
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 500..=8_000,
            re_attempts: 2,
            jitter_ratio: 0.2,
        };
        let resolved = attempt(self.upload_once(&pdf_bytes, file_name).await)
            .retry_with_async(|_| async {
                attempt(self.upload_once(&pdf_bytes, file_name).await)
            })
            .with_exponential_jitter(|| jitter)
            .await;
        settle(resolved)
    }

    async fn upload_once(
        &self,
        pdf_bytes: &[u8],
        file_name: &str,
    ) -> Result<String, OcrCallError> {
        let form = multipart::Form::new().part(
            "file",
            multipart::Part::bytes(pdf_bytes.to_vec())
                .file_name(file_name.to_owned())
                .mime_str("application/pdf")
                .unwrap_or_else(|_| multipart::Part::bytes(pdf_bytes.to_vec())),
        );
        let response = self
            .http
            .post(format!("{}/v2/pdf", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(OcrCallError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(OcrCallError::Status(status));
        }
        let body: Value = response.json().await.map_err(OcrCallError::Body)?;
        body.get("id")
            .or_else(|| body.get("file_id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or(OcrCallError::MissingId)
    }

    /// Poll for the result until a terminal status or the deadline.
    async fn poll(&self, file_id: &str) -> Result<OcrPages, OcrCallError> {
        let url = format!("{}/v2/result/{}", self.base_url, file_id);
        let deadline = Instant::now() + self.poll_deadline;

        loop {
            if Instant::now() >= deadline {
                return Err(OcrCallError::DeadlineExceeded);
            }

            let mut wait = self.poll_interval;
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        // Honor the service's own back-off request.
                        if let Some(hint) = retry_after(&response) {
                            wait = hint;
                        }
                    } else if status.is_server_error() {
                        debug!(%status, "OCR poll returned server error, retrying");
                    } else if !status.is_success() {
                        return Err(OcrCallError::Status(status));
                    } else {
                        let body =
                            response.json::<Value>().await.map_err(OcrCallError::Body)?;
                        let job_status = body
                            .get("status")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_lowercase();
                        if DONE_STATUSES.contains(&job_status.as_str()) {
                            trace!(%body, "OCR result body");
                            return Ok(filter_ocr_pages(&body));
                        }
                        if FAILED_STATUSES.contains(&job_status.as_str()) {
                            let detail = body
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("no detail")
                                .to_owned();
                            return Err(OcrCallError::JobFailed(detail));
                        }
                        trace!(job_status = %job_status, "OCR still processing");
                    }
                }
                // Individual poll calls are cheap; any transport hiccup is
                // absorbed by the deadline rather than failing the job.
                Err(err) => {
                    debug!("OCR poll transport error, retrying: {}", err);
                }
            }

            time::sleep(wait).await;
        }
    }
}
