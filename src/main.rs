use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

use docverify::{
    config::Settings,
    prelude::*,
    server::{self, AppState},
    store::{PgRunStore, RunStore, spawn_retention_janitor},
};

/// Verify loan-deferment documents against a declared applicant identity.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OCR_BASE_URL, LLM_ENDPOINT: External service endpoints (required).
  - DATABASE_URL: Postgres connection string.
  - S3_ENDPOINT, S3_ACCESS_KEY, S3_SECRET_KEY, S3_BUCKET: Object store.
  - DOCVERIFY_BIND: Listen address (default 0.0.0.0:8080).

  See the README for the full list. These variables may be set in a
  standard `.env` file.
"#
)]
struct Opts {
    /// Override the listen address from the environment.
    #[clap(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run().await
}

/// Line-oriented logs on stderr for a long-running service. `RUST_LOG`
/// wins when set, `info` otherwise; span-close events carry per-request
/// timings without needing a separate metrics layer.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();
}

/// Startup proper: environment, store and migrations, background janitor,
/// then the HTTP server until shutdown.
async fn run() -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    let mut settings = Settings::from_env()?;
    if let Some(bind) = opts.bind {
        settings.bind_addr = bind;
    }
    // Settings carry credentials; log only what is safe to echo.
    debug!(
        bind = %settings.bind_addr,
        ocr = %settings.ocr_base_url,
        llm = %settings.llm_endpoint,
        "configuration loaded"
    );

    let store = PgRunStore::connect(&settings)?;
    // The pool is lazy, so a database that is still coming up only delays
    // migrations, not startup; rows fail loudly until it arrives.
    if let Err(err) = store.migrate().await {
        warn!("database migration failed, continuing: {:#}", err);
    }
    let store: Arc<dyn RunStore> = Arc::new(store);

    let janitor = spawn_retention_janitor(
        store.clone(),
        settings.runs_retention_days,
        settings.retention_sweep_interval,
    );

    let state = AppState::new(settings, store).await?;
    let result = server::serve(state).await;

    janitor.abort();
    result
}
