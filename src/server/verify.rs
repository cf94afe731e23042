//! `POST /v1/verify` — synchronous verification of an uploaded document.

use axum::{
    Extension, Json,
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::{AppState, TraceId, problem::Problem};
use crate::{
    errors::ErrorCode,
    pipeline::{self, RunRequest, RunSource},
    prelude::*,
};

const INSTANCE: &str = "/v1/verify";

/// Multipart contract: a binary `file` part and a `fio` text field. The
/// verdict is a business outcome, so the response is 200 even when false;
/// only system and client errors become problem responses.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
    mut multipart: Multipart,
) -> Response {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut fio: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return body_error(err, &trace),
        };
        match field.name().unwrap_or_default() {
            "file" => {
                let file_name = field
                    .file_name()
                    .unwrap_or("document")
                    .to_owned();
                match field.bytes().await {
                    Ok(bytes) => file = Some((file_name, bytes.to_vec())),
                    Err(err) => return body_error(err, &trace),
                }
            }
            "fio" => match field.text().await {
                Ok(text) => fio = Some(text),
                Err(err) => return body_error(err, &trace),
            },
            // Unknown fields are drained and ignored.
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let Some((file_name, bytes)) = file else {
        return Problem::validation("missing `file` part", &trace.0, INSTANCE)
            .into_response();
    };
    let Some(declared_fio) = fio else {
        return Problem::validation("missing `fio` field", &trace.0, INSTANCE)
            .into_response();
    };
    if declared_fio.trim().is_empty() {
        return Problem::validation("`fio` must not be empty", &trace.0, INSTANCE)
            .into_response();
    }

    let request = RunRequest {
        declared_fio,
        external_request_id: None,
        iin: None,
        first_name: None,
        last_name: None,
        second_name: None,
        source: RunSource::Upload { file_name, bytes },
        trace_id: trace.0.clone(),
    };

    match pipeline::execute(&state, request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            Problem::from_pipeline_error(&err, &trace.0, INSTANCE).into_response()
        }
    }
}

/// Map a multipart read failure: body-limit overruns become 413, anything
/// else is a malformed request.
fn body_error(err: MultipartError, trace: &TraceId) -> Response {
    let detail = err.to_string();
    let code = if err.into_response().status() == StatusCode::PAYLOAD_TOO_LARGE {
        ErrorCode::PayloadTooLarge
    } else {
        ErrorCode::ValidationError
    };
    Problem::from_code(code, detail, &trace.0, INSTANCE).into_response()
}
