//! End-to-end scenarios: the real router and pipeline, with wiremock
//! doubles standing in for the OCR and LLM services and an in-memory run
//! store standing in for Postgres.

use std::sync::Mutex;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Utc};
use tower::ServiceExt as _;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

use docverify::{
    config::Settings,
    pdf,
    prelude::*,
    server::{AppState, build_router},
    store::{PoolStatus, RunRecord, RunStatus, RunStore},
};

/// In-memory stand-in for the Postgres store.
#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<RunRecord>>,
}

impl MemoryStore {
    fn rows(&self) -> Vec<RunRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn upsert_run(&self, record: &RunRecord) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|row| row.run_id == record.run_id) {
            Some(existing) => *existing = record.clone(),
            None => rows.push(record.clone()),
        }
        Ok(())
    }

    async fn purge_expired(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    #[allow(dead_code)]
    ocr: MockServer,
    #[allow(dead_code)]
    llm: MockServer,
}

async fn test_app() -> TestApp {
    let ocr = MockServer::start().await;
    let llm = MockServer::start().await;
    let settings = Settings::for_tests(ocr.uri(), format!("{}/completions", llm.uri()));
    let store = Arc::new(MemoryStore::default());
    let dyn_store: Arc<dyn RunStore> = store.clone();
    let state = AppState::new(settings, dyn_store)
        .await
        .expect("state should build");
    TestApp {
        router: build_router(state),
        store,
        ocr,
        llm,
    }
}

/// "Today" the way the validity evaluator sees it: UTC+5.
fn today_utc5() -> NaiveDate {
    Utc::now()
        .with_timezone(&FixedOffset::east_opt(5 * 3600).unwrap())
        .date_naive()
}

async fn mount_ocr_success(ocr: &MockServer, page_texts: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/v2/pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "job-1"})),
        )
        .mount(ocr)
        .await;
    let pages: Vec<Value> = page_texts
        .iter()
        .enumerate()
        .map(|(idx, text)| json!({"page_number": idx + 1, "text": text}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/v2/result/job-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "done", "pages": pages})),
        )
        .mount(ocr)
        .await;
}

/// The two LLM calls are told apart by distinctive prompt text.
async fn mount_llm(llm: &MockServer, doc_type_payload: Value, extract_payload: Value) {
    Mock::given(method("POST"))
        .and(body_string_contains("определяющий тип документа"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": doc_type_payload.to_string()}}]
        })))
        .mount(llm)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("извлекающий данные"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": extract_payload.to_string()}}]
        })))
        .mount(llm)
        .await;
}

const BOUNDARY: &str = "docverify-test-boundary";

fn multipart_request(fio: &str, file_bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"fio\"\r\n\r\n{fio}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"document.pdf\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(file_bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/v1/verify")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_happy_path() {
    let app = test_app().await;
    mount_ocr_success(
        &app.ocr,
        &[
            "Приказ о декретном отпуске. Иванов И.И.",
            "Дата выдачи: 2025-11-01",
        ],
    )
    .await;
    let recent = today_utc5() - Days::new(10);
    mount_llm(
        &app.llm,
        json!({"doc_type": "maternity_leave_order", "single_doc_type_valid": true}),
        json!({
            "fio": "Иванов И.И.",
            "doc_date": recent.format("%Y-%m-%d").to_string(),
            "organization": "ТОО Ромашка",
        }),
    )
    .await;

    let pdf = pdf::blank_pdf(2).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-trace-id"));
    let body = response_json(response).await;
    assert_eq!(body["verdict"], true);
    assert_eq!(body["errors"], json!([]));
    assert!(body["processing_time_seconds"].as_f64().unwrap() >= 0.0);
    assert!(body["run_id"].as_str().unwrap().len() > 10);

    // Exactly one row, consistent with the response.
    let rows = app.store.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.run_id, body["run_id"].as_str().unwrap());
    assert_eq!(row.status, RunStatus::Success);
    assert!(row.verdict);
    assert!(row.errors.is_empty());
    assert_eq!(row.doc_type.as_deref(), Some("maternity_leave_order"));
    assert_eq!(row.fio_match, Some(true));
    assert!(row.processing_time_seconds >= 0.0);
}

#[tokio::test]
async fn test_fio_mismatch_is_a_business_outcome() {
    let app = test_app().await;
    mount_ocr_success(&app.ocr, &["Справка. Иванов Иван."]).await;
    let recent = today_utc5() - Days::new(5);
    mount_llm(
        &app.llm,
        json!({"doc_type": "certificate_of_illness", "single_doc_type_valid": true}),
        json!({
            "fio": "Иванов Иван",
            "doc_date": recent.format("%Y-%m-%d").to_string(),
        }),
    )
    .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Петров Петр Петрович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["verdict"], false);
    assert_eq!(body["errors"][0]["code"], "FIO_MISMATCH");

    let rows = app.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RunStatus::BusinessError);
    assert!(!rows[0].verdict);
}

#[tokio::test]
async fn test_expired_document() {
    let app = test_app().await;
    mount_ocr_success(&app.ocr, &["Справка от 2024-01-01. Иванов Иван."]).await;
    mount_llm(
        &app.llm,
        json!({"doc_type": "certificate_of_illness", "single_doc_type_valid": true}),
        json!({"fio": "Иванов Иван Иванович", "doc_date": "2024-01-01"}),
    )
    .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["verdict"], false);
    assert_eq!(body["errors"][0]["code"], "DOC_DATE_TOO_OLD");
}

#[tokio::test]
async fn test_multiple_failures_keep_order() {
    let app = test_app().await;
    mount_ocr_success(&app.ocr, &["Нечитаемый документ"]).await;
    mount_llm(
        &app.llm,
        json!({"doc_type": null, "single_doc_type_valid": true}),
        json!({"fio": null, "doc_date": null}),
    )
    .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["verdict"], false);
    let codes: Vec<&str> = body["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|err| err["code"].as_str().unwrap())
        .collect();
    assert_eq!(
        codes,
        vec!["FIO_MISMATCH", "DOC_TYPE_UNKNOWN", "DOC_DATE_MISSING"]
    );
}

#[tokio::test]
async fn test_too_many_pages_is_a_client_error() {
    let app = test_app().await;
    // Neither external service should be consulted for an oversized PDF.

    let pdf = pdf::blank_pdf(5).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let body = response_json(response).await;
    assert_eq!(body["code"], "PDF_TOO_MANY_PAGES");
    assert_eq!(body["category"], "client_error");
    assert_eq!(body["retryable"], false);

    let rows = app.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RunStatus::ClientError);
    assert_eq!(rows[0].error_code.as_deref(), Some("PDF_TOO_MANY_PAGES"));
}

#[tokio::test]
async fn test_unsupported_media_type() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван", b"plain text, not a document"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = response_json(response).await;
    assert_eq!(body["code"], "UNSUPPORTED_MEDIA_TYPE");
}

#[tokio::test]
async fn test_multiple_documents_rejected_at_classification() {
    let app = test_app().await;
    mount_ocr_success(&app.ocr, &["Справка и приказ в одном файле"]).await;
    mount_llm(
        &app.llm,
        json!({"doc_type": "certificate_of_illness", "single_doc_type_valid": false}),
        json!({"fio": "Иванов Иван", "doc_date": "2025-01-01"}),
    )
    .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["code"], "MULTIPLE_DOCUMENTS");
    assert_eq!(body["category"], "client_error");

    let rows = app.store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RunStatus::ClientError);
}

#[tokio::test]
async fn test_ocr_outage_trips_the_breaker() {
    let app = test_app().await;
    // A non-retryable upload failure keeps the test fast; each failed run
    // still counts one breaker strike.
    Mock::given(method("POST"))
        .and(path("/v2/pdf"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&app.ocr)
        .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    // The test breaker opens after 3 consecutive failures.
    for _ in 0..3 {
        let response = app
            .router
            .clone()
            .oneshot(multipart_request("Иванов Иван", &pdf))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response_json(response).await;
        assert_eq!(body["code"], "OCR_FAILED");
        assert_eq!(body["retryable"], true);
    }

    // While open, calls fail fast with a Retry-After hint and never reach
    // the service.
    let requests_before = app.ocr.received_requests().await.unwrap().len();
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("Иванов Иван", &pdf))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let body = response_json(response).await;
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
    let requests_after = app.ocr.received_requests().await.unwrap().len();
    assert_eq!(requests_before, requests_after);

    let rows = app.store.rows();
    assert_eq!(rows.len(), 4);
}

#[tokio::test]
async fn test_resubmission_yields_new_run_with_same_outcome() {
    let app = test_app().await;
    mount_ocr_success(&app.ocr, &["Справка. Иванов Иван."]).await;
    let recent = today_utc5() - Days::new(3);
    mount_llm(
        &app.llm,
        json!({"doc_type": "certificate_of_illness", "single_doc_type_valid": true}),
        json!({
            "fio": "Иванов Иван Иванович",
            "doc_date": recent.format("%Y-%m-%d").to_string(),
        }),
    )
    .await;

    let pdf = pdf::blank_pdf(1).unwrap();
    let first = response_json(
        app.router
            .clone()
            .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
            .await
            .unwrap(),
    )
    .await;
    let second = response_json(
        app.router
            .clone()
            .oneshot(multipart_request("Иванов Иван Иванович", &pdf))
            .await
            .unwrap(),
    )
    .await;

    assert_ne!(first["run_id"], second["run_id"]);
    assert_eq!(first["verdict"], second["verdict"]);
    assert_eq!(first["errors"], second["errors"]);
    assert_eq!(app.store.rows().len(), 2);
}

#[tokio::test]
async fn test_missing_fio_field_is_rejected() {
    let app = test_app().await;
    let pdf = pdf::blank_pdf(1).unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"document.pdf\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&pdf);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/verify")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    // Nothing reached the pipeline, so nothing was persisted.
    assert!(app.store.rows().is_empty());
}

#[tokio::test]
async fn test_kafka_verify_rejects_bad_iin() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/kafka/verify")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "request_id": 42,
                "s3_path": "uploads/doc.pdf",
                "iin": "not-an-iin",
                "first_name": "Иван",
                "last_name": "Иванов",
                "second_name": null,
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_healthz_reports_breakers() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["breakers"]["ocr"], "closed");
    assert_eq!(body["breakers"]["llm"], "closed");
}
