use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod onstaq;
mod pagination;
mod store;
mod template;

pub use error::{ApiError, ApiResult, AppError};

use automation::{RuleExecutor, TriggerManager};
use onstaq::OnstaqClient;
use store::{ExecutionStore, RuleStore, WebhookStore};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub client: Arc<OnstaqClient>,
    pub executor: Arc<RuleExecutor>,
    pub manager: Arc<TriggerManager>,
    pub rules: RuleStore,
    pub executions: ExecutionStore,
    pub webhooks: WebhookStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;

    let client = Arc::new(OnstaqClient::new(
        &config.onstaq.api_url,
        &config.onstaq.service_email,
        &config.onstaq.service_password,
    ));
    if config.onstaq.has_credentials() {
        match client.login().await {
            Ok(()) => match client.get_me().await {
                Ok(me) => tracing::info!("Authenticated against upstream as {}", me.email),
                Err(e) => tracing::warn!("Upstream identity check failed: {}", e),
            },
            Err(e) => {
                tracing::warn!("Initial upstream login failed, will retry on demand: {}", e)
            }
        }
    } else {
        tracing::warn!("No upstream service credentials configured");
    }

    let executions = ExecutionStore::new(db_pool.clone());
    let interrupted = executions.fail_interrupted().await?;
    if interrupted > 0 {
        tracing::warn!("Failed {} executions interrupted by restart", interrupted);
    }

    let executor = Arc::new(RuleExecutor::new(
        db_pool.clone(),
        client.clone(),
        config.max_concurrent_executions,
    ));
    let manager = Arc::new(TriggerManager::new(
        db_pool.clone(),
        client.clone(),
        executor.clone(),
        Duration::from_millis(config.effective_poll_interval_ms()),
    ));

    let rules = RuleStore::new(db_pool.clone());
    let enabled = rules.list_enabled().await?;
    manager.start_all(&enabled).await?;

    let app_state = Arc::new(AppState {
        db_pool: db_pool.clone(),
        client,
        executor,
        manager,
        rules,
        executions,
        webhooks: WebhookStore::new(db_pool),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/health", get(handlers::health_check))
        .nest("/api/automations", handlers::automation_routes())
        .nest("/api/executions", handlers::execution_routes())
        .nest("/api/webhooks", handlers::webhook_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("Automation engine listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down: stopping triggers and draining executions");
    state.manager.stop_all().await;
    state.executor.stop().await;
}
