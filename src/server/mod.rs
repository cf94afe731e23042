//! The HTTP surface: router, shared state, trace-id propagation, health
//! probe and graceful shutdown.

pub mod problem;
pub mod queue;
pub mod verify;

use std::future::IntoFuture;
use std::pin::pin;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tokio::{net::TcpListener, sync::watch, time};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    breaker::BreakerRegistry,
    config::Settings,
    fetcher::ObjectFetcher,
    llm::LlmClient,
    ocr::OcrClient,
    pipeline,
    prelude::*,
    prompts::PromptSet,
    store::RunStore,
};

/// Everything shared across requests: clients, breakers, prompts, store.
/// Created once at startup, torn down at process exit.
pub struct AppState {
    pub settings: Settings,
    pub prompts: PromptSet,
    pub dtc_validator: jsonschema::Validator,
    pub extract_validator: jsonschema::Validator,
    pub breakers: BreakerRegistry,
    pub ocr: OcrClient,
    pub llm: LlmClient,
    pub fetcher: ObjectFetcher,
    pub store: Arc<dyn RunStore>,
}

impl AppState {
    /// Wire up the shared state from settings and a store implementation.
    pub async fn new(settings: Settings, store: Arc<dyn RunStore>) -> Result<Arc<Self>> {
        let prompts = PromptSet::load(&settings).await?;

        let dtc_schema = pipeline::doc_type_check_schema();
        let dtc_validator = jsonschema::validator_for(&dtc_schema)
            .map_err(|err| anyhow!("invalid doc-type-check schema: {}", err))?;
        let extract_schema = pipeline::extraction_schema();
        let extract_validator = jsonschema::validator_for(&extract_schema)
            .map_err(|err| anyhow!("invalid extraction schema: {}", err))?;

        let breakers = BreakerRegistry::new(
            settings.breaker_failure_threshold,
            settings.breaker_cooldown,
        );
        let ocr = OcrClient::new(&settings, breakers.ocr.clone())?;
        let llm = LlmClient::new(&settings, breakers.llm.clone())?;
        let fetcher = ObjectFetcher::new(&settings);

        Ok(Arc::new(Self {
            settings,
            prompts,
            dtc_validator,
            extract_validator,
            breakers,
            ocr,
            llm,
            fetcher,
            store,
        }))
    }
}

/// The trace id assigned to one HTTP request, propagated through the run
/// context, every log line and the persistence row.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

async fn assign_trace_id(mut request: Request, next: Next) -> Response {
    let trace_id = TraceId(Uuid::new_v4().to_string());
    request.extensions_mut().insert(trace_id.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id.0) {
        response.headers_mut().insert("x-trace-id", value);
    }
    response
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    // Leave some headroom over the document limit for multipart framing;
    // the acquire stage enforces the exact byte cap.
    let body_limit = state.settings.max_upload_bytes + 64 * 1024;
    Router::new()
        .route("/v1/verify", post(verify::verify))
        .route("/v1/kafka/verify", post(queue::kafka_verify))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(assign_trace_id))
        .with_state(state)
}

/// Health probe: reports breaker states and DB pool occupancy.
async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "breakers": state.breakers.snapshot(),
        "db_pool": state.store.pool_status(),
    }))
}

/// Run the server until a shutdown signal, then drain in-flight requests
/// for a bounded interval.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(&state.settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.settings.bind_addr))?;
    info!("listening on {}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let drain = state.settings.shutdown_drain;
    let mut graceful_rx = shutdown_rx.clone();
    let server = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.wait_for(|stop| *stop).await;
        })
        .into_future();

    let mut server = pin!(server);
    let mut signal_rx = shutdown_rx.clone();
    tokio::select! {
        result = &mut server => {
            result.context("server error")?;
        }
        _ = signal_rx.wait_for(|stop| *stop) => {
            info!("shutdown signal received, draining in-flight runs");
            if time::timeout(drain, &mut server).await.is_err() {
                warn!("drain deadline reached, forcing shutdown");
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
