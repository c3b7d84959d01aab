use std::sync::Arc;

use axum::{routing::get, Json, Router};
use dotenvy::dotenv;
use log::info;
use tower_http::cors::{Any, CorsLayer};

use mailroom::audit::{configure_audit_routes, AuditLog, PgAuditLog};
use mailroom::connector::{ImapSource, MailSource};
use mailroom::core::config::AppConfig;
use mailroom::core::shared::state::AppState;
use mailroom::core::shared::utils::{create_conn, run_migrations};
use mailroom::ingest::store::{IngestStore, PgIngestStore};
use mailroom::ingest::IngestPipeline;
use mailroom::mailbox::{configure_mailbox_routes, ConfigStore, PgConfigStore};
use mailroom::notify::activity_channel;
use mailroom::scheduler::MailboxSweeper;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mailroom",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_conn()?;
    run_migrations(&pool).map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;

    let (activity, _keepalive) = activity_channel();

    let configs: Arc<dyn ConfigStore> = Arc::new(PgConfigStore::new(pool.clone()));
    let audit: Arc<dyn AuditLog> = Arc::new(PgAuditLog::new(pool.clone()));
    let store: Arc<dyn IngestStore> = Arc::new(PgIngestStore::new(pool.clone()));
    let source: Arc<dyn MailSource> = Arc::new(ImapSource::new(
        config.sweep.connect_timeout(),
        config.sweep.fetch_timeout(),
    ));

    let pipeline = Arc::new(IngestPipeline::new(
        source,
        store,
        audit.clone(),
        activity.clone(),
        config.sweep.cycle_budget(),
    ));
    let sweeper = Arc::new(MailboxSweeper::new(
        configs.clone(),
        pipeline,
        config.sweep.tick_interval(),
        config.sweep.max_workers,
    ));
    let _sweep_task = sweeper.clone().spawn();

    let state = Arc::new(AppState {
        config: config.clone(),
        configs,
        audit,
        sweeper,
        activity,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .merge(configure_mailbox_routes())
        .merge(configure_audit_routes())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Mailroom API listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
