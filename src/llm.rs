//! Client for the LLM inference endpoint.
//!
//! The endpoint is a plain JSON-in/JSON-out completion API: we POST
//! `{Model, Content, Temperature, MaxTokens}` and read back an envelope
//! whose useful payload hides inside `choices[0].message.content`. Payload
//! extraction is the response filter's job; this module only delivers the
//! envelope, with retry, timeout and circuit-breaker handling.

use core::fmt;
use std::error;

use keen_retry::ExponentialJitter;
use reqwest::StatusCode;

use crate::{
    breaker::CircuitBreaker,
    config::Settings,
    errors::{ErrorCode, PipelineError},
    prelude::*,
    retry::{Transience, attempt, settle, transient_http_status},
};

/// The completion request body. Field names are fixed by the endpoint's
/// contract, capitalization included.
#[derive(Clone, Debug, Serialize)]
struct CompletionRequest<'a> {
    #[serde(rename = "Model")]
    model: &'a str,
    #[serde(rename = "Content")]
    content: &'a str,
    #[serde(rename = "Temperature")]
    temperature: f32,
    #[serde(rename = "MaxTokens")]
    max_tokens: u32,
}

/// An error which occurred while calling the LLM.
#[derive(Debug)]
enum LlmCallError {
    /// A transport-level failure, including client-side timeouts.
    Request(reqwest::Error),
    /// An unexpected HTTP status.
    Status(StatusCode),
    /// The response body could not be read or was not JSON.
    Body(reqwest::Error),
}

impl Transience for LlmCallError {
    fn is_transient(&self) -> bool {
        match self {
            // Client-side timeouts included: a runaway generation or an
            // overloaded server can do better on a fresh attempt.
            LlmCallError::Request(_) => true,
            LlmCallError::Status(status) => transient_http_status(*status),
            LlmCallError::Body(_) => false,
        }
    }
}

impl LlmCallError {
    fn is_timeout(&self) -> bool {
        matches!(self, LlmCallError::Request(err) if err.is_timeout())
    }
}

impl fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmCallError::Request(err) if err.is_timeout() => {
                write!(f, "LLM request timed out")
            }
            LlmCallError::Request(err) => write!(f, "LLM transport error: {}", err),
            LlmCallError::Status(status) => write!(f, "LLM returned HTTP {}", status),
            LlmCallError::Body(err) => write!(f, "LLM response body unreadable: {}", err),
        }
    }
}

impl error::Error for LlmCallError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            LlmCallError::Request(err) | LlmCallError::Body(err) => Some(err),
            LlmCallError::Status(_) => None,
        }
    }
}

/// Client for the LLM endpoint.
#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    breaker: Arc<CircuitBreaker>,
}

impl LlmClient {
    pub fn new(settings: &Settings, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.llm_request_timeout)
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            http,
            endpoint: settings.llm_endpoint.clone(),
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
            max_tokens: settings.llm_max_tokens,
            breaker,
        })
    }

    /// Send one completion request and return the raw response envelope.
    ///
    /// Transient failures are retried up to three attempts total with
    /// exponential backoff; the circuit breaker sees the final outcome.
    #[instrument(level = "debug", skip_all)]
    pub async fn complete(&self, content: &str) -> Result<Value, PipelineError> {
        self.breaker.try_acquire().map_err(|cooldown| {
            PipelineError::new(ErrorCode::ServiceUnavailable, "LLM circuit breaker open")
                .with_retry_after(cooldown)
        })?;

        let request = CompletionRequest {
            model: &self.model,
            content,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 500..=8_000,
            re_attempts: 2,
            jitter_ratio: 0.2,
        };
        let resolved = attempt(self.complete_once(&request).await)
            .retry_with_async(|_| async { attempt(self.complete_once(&request).await) })
            .with_exponential_jitter(|| jitter)
            .await;

        match settle(resolved) {
            Ok(envelope) => {
                self.breaker.record_success();
                Ok(envelope)
            }
            Err(err) => {
                self.breaker.record_failure();
                let code = if err.is_timeout() {
                    ErrorCode::LlmTimeout
                } else {
                    ErrorCode::LlmFailed
                };
                Err(PipelineError::new(code, err.to_string())
                    .with_cause(anyhow!("{}", err)))
            }
        }
    }

    async fn complete_once(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Value, LlmCallError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(LlmCallError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmCallError::Status(status));
        }

        let envelope: Value = response.json().await.map_err(LlmCallError::Body)?;
        debug!(%envelope, "LLM response envelope");
        Ok(envelope)
    }
}
