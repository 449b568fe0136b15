use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use sqlx::postgres::PgPoolOptions;

use ingestion_common::http_client::{HttpClient, HttpClientConfig};
use ingestion_common::metrics::{serve as serve_metrics, setup_metrics_router};
use ingestion_common::registry::JobRegistry;
use ingestion_common::retry::RetryPolicy;
use ingestion_common::smart_auth::SmartAssertionSigner;

use crate::config::Config;

mod config;
mod handlers;

/// Shared state handed to every handler: the job registry, a pre-built HTTP
/// client and database pool for the pipeline context, and the optional SMART
/// Backend Services signer built once at startup rather than per request.
#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    pub http: HttpClient,
    pub db: sqlx::PgPool,
    pub bulk_data_dir: PathBuf,
    pub download_concurrency: usize,
    pub progress_log_interval: u64,
    pub fhir_server_url_hint: Option<String>,
    pub smart_signer: Option<Arc<SmartAssertionSigner>>,
    pub liveness: HealthRegistry,
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let db = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    sqlx::migrate!("../ingestion-common/migrations")
        .run(&db)
        .await
        .expect("failed to run database migrations");

    let retry_policy = RetryPolicy::new(
        config.retry_max_attempts,
        config.retry_base_delay.0,
        config.retry_max_delay.0,
    );
    let http_client_config = HttpClientConfig {
        connect_timeout: config.http_timeout_connect.0,
        request_timeout: std::cmp::max(config.http_timeout_read.0, config.http_timeout_write.0),
        pool_idle_timeout: config.http_timeout_pool.0,
    };
    let http = HttpClient::new(http_client_config, retry_policy)
        .expect("failed to build http client");

    let smart_signer = build_smart_signer(&config, &http);

    let liveness = HealthRegistry::new("liveness");
    // No standalone background loop owns this process the way hook-worker's
    // dequeue loop does; each kicked-off job registers and reports its own
    // component (see `bulk_export::drive`), so the process itself is always
    // considered healthy once it's accepting requests.
    liveness
        .register("ingestion-service".to_string(), time::Duration::seconds(3600))
        .await
        .report_healthy()
        .await;

    let state = AppState {
        registry: JobRegistry::new(),
        http,
        db,
        bulk_data_dir: PathBuf::from(&config.bulk_data_dir),
        download_concurrency: config.download_concurrency,
        progress_log_interval: config.progress_log_interval,
        fhir_server_url_hint: config.fhir_server_url_hint.clone(),
        smart_signer,
        liveness,
    };

    let app = handlers::add_routes(Router::new(), state, config.max_body_size);

    let metrics_bind = format!("{}:{}", config.host, config.port + 1);
    tokio::task::spawn(async move {
        let router = setup_metrics_router();
        if let Err(err) = serve_metrics(router, &metrics_bind).await {
            tracing::error!("failed to start serving metrics: {}", err);
        }
    });

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start ingestion-service http server, {}", e),
    }
}

/// Builds the process-wide SMART Backend Services signer when the deployment
/// configured one. Left `None` when any of the three required fields is
/// absent, in which case every kick-off/resume request must supply its own
/// `bearer_token` (spec.md §4.3/§6.1).
fn build_smart_signer(config: &Config, http: &HttpClient) -> Option<Arc<SmartAssertionSigner>> {
    let client_id = config.smart.smart_client_id.as_deref()?;
    let token_url = config.smart.smart_token_url.as_deref()?;
    let private_key = config.smart.smart_private_key.as_deref()?;

    match SmartAssertionSigner::new(
        token_url,
        client_id,
        private_key,
        &config.smart.smart_algorithm,
        http.clone(),
    ) {
        Ok(signer) => Some(Arc::new(signer)),
        Err(err) => {
            tracing::error!("configured SMART signer could not be built: {}", err);
            None
        }
    }
}

