//! RFC-7807 problem responses for system and client errors.
//!
//! Business outcomes never travel this way; they ride a 200 response with
//! `verdict=false`. Everything else becomes `application/problem+json`
//! with the machine-readable code, category, retryability and trace id.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    errors::{ErrorCode, PipelineError},
    prelude::*,
};

#[derive(Debug, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: &'static str,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub code: &'static str,
    pub category: &'static str,
    pub retryable: bool,
    pub trace_id: String,
    #[serde(skip)]
    retry_after: Option<Duration>,
}

impl Problem {
    /// Wrap a pipeline failure for the wire.
    pub fn from_pipeline_error(err: &PipelineError, trace_id: &str, instance: &str) -> Self {
        Self {
            type_uri: "about:blank",
            title: err.code.message_ru().to_owned(),
            status: err.code.http_status().as_u16(),
            detail: err.full_detail(),
            instance: instance.to_owned(),
            code: err.code.as_str(),
            category: err.category.as_str(),
            retryable: err.retryable,
            trace_id: trace_id.to_owned(),
            retry_after: err.retry_after,
        }
    }

    /// A 422 for malformed requests caught before the pipeline starts.
    pub fn validation(detail: impl Into<String>, trace_id: &str, instance: &str) -> Self {
        Self::from_code(ErrorCode::ValidationError, detail, trace_id, instance)
    }

    pub fn from_code(
        code: ErrorCode,
        detail: impl Into<String>,
        trace_id: &str,
        instance: &str,
    ) -> Self {
        Self {
            type_uri: "about:blank",
            title: code.message_ru().to_owned(),
            status: code.http_status().as_u16(),
            detail: detail.into(),
            instance: instance.to_owned(),
            code: code.as_str(),
            category: code.category().as_str(),
            retryable: code.default_retryable(),
            trace_id: trace_id.to_owned(),
            retry_after: None,
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if let Some(hint) = retry_after {
            // Round up so "0 seconds left" doesn't invite an instant retry.
            let seconds = hint.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
