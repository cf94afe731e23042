//! `POST /v1/kafka/verify` — pipeline invocation for queue-delivered
//! events carrying an object-store path and applicant metadata.
//!
//! The Kafka consumer itself lives upstream; it converts each event into
//! this HTTP call. The response contract is identical to `/v1/verify`.

use axum::{
    Extension, Json,
    extract::State,
    response::{IntoResponse, Response},
};

use super::{AppState, TraceId, problem::Problem};
use crate::{
    pipeline::{self, RunRequest, RunSource},
    prelude::*,
};

const INSTANCE: &str = "/v1/kafka/verify";

#[derive(Debug, Deserialize)]
struct KafkaVerifyRequest {
    request_id: i64,
    s3_path: String,
    /// 12-digit national id; upstream serializers disagree on whether it
    /// is a number or a string.
    iin: Value,
    first_name: String,
    last_name: String,
    #[serde(default)]
    second_name: Option<String>,
}

/// Accept the body as raw JSON so schema failures map onto our own
/// problem shape instead of the framework's default rejection.
pub async fn kafka_verify(
    State(state): State<Arc<AppState>>,
    Extension(trace): Extension<TraceId>,
    Json(body): Json<Value>,
) -> Response {
    let request: KafkaVerifyRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            return Problem::validation(
                format!("invalid request body: {}", err),
                &trace.0,
                INSTANCE,
            )
            .into_response();
        }
    };

    let iin = match normalize_iin(&request.iin) {
        Some(iin) => iin,
        None => {
            return Problem::validation(
                "`iin` must be a 12-digit national id",
                &trace.0,
                INSTANCE,
            )
            .into_response();
        }
    };
    if request.last_name.trim().is_empty() || request.first_name.trim().is_empty() {
        return Problem::validation(
            "`last_name` and `first_name` must not be empty",
            &trace.0,
            INSTANCE,
        )
        .into_response();
    }
    if request.s3_path.trim().is_empty() {
        return Problem::validation("`s3_path` must not be empty", &trace.0, INSTANCE)
            .into_response();
    }

    let declared_fio = compose_fio(
        &request.last_name,
        &request.first_name,
        request.second_name.as_deref(),
    );

    let run_request = RunRequest {
        declared_fio,
        external_request_id: Some(request.request_id),
        iin: Some(iin),
        first_name: Some(request.first_name),
        last_name: Some(request.last_name),
        second_name: request.second_name,
        source: RunSource::ObjectStore {
            key: request.s3_path,
        },
        trace_id: trace.0.clone(),
    };

    match pipeline::execute(&state, run_request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            Problem::from_pipeline_error(&err, &trace.0, INSTANCE).into_response()
        }
    }
}

/// FIO order is surname, given name, patronymic; the trailing component is
/// optional and often empty in upstream events.
fn compose_fio(last_name: &str, first_name: &str, second_name: Option<&str>) -> String {
    let mut fio = format!("{} {}", last_name.trim(), first_name.trim());
    if let Some(second) = second_name {
        if !second.trim().is_empty() {
            fio.push(' ');
            fio.push_str(second.trim());
        }
    }
    fio
}

/// Accept the IIN as a JSON number or string; numbers are zero-padded back
/// to twelve digits since integer serialization drops leading zeros.
fn normalize_iin(raw: &Value) -> Option<String> {
    let iin = match raw {
        Value::String(text) => text.trim().to_owned(),
        Value::Number(number) => format!("{:012}", number.as_i64()?),
        _ => return None,
    };
    if iin.len() == 12 && iin.chars().all(|ch| ch.is_ascii_digit()) {
        Some(iin)
    } else {
        None
    }
}
