use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get, routing::post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use guard_api::AppState;
use guard_api::alert::{AlertDispatcher, SmtpConfig};
use guard_api::config::GuardConfig;
use guard_api::controller::RollbackController;
use guard_api::handlers;
use guard_api::migration::SchemaMigrationCoordinator;
use guard_api::ports::{
    HttpCacheInvalidator, HttpControlPlane, HttpMetricsProvider, HttpMigrationTool,
    HttpReadinessCheck,
};
use guard_api::probe::ServiceHealthProbe;
use guard_api::session_store::SqliteSessionStore;
use guard_api::sessions::SessionPreservationManager;
use guard_api::state_db::StateDb;
use guard_api::switcher::VersionSwitcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("guard_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("GUARD_CONFIG").unwrap_or_else(|_| "./guard.toml".to_string());
    let config = GuardConfig::load(&config_path)?;

    let state_db_path =
        std::env::var("GUARD_STATE_DB").unwrap_or_else(|_| "./guard_state.db".to_string());
    let state_db = Arc::new(StateDb::open(&state_db_path)?);
    tracing::info!("state db opened at {state_db_path}");

    let session_db_path =
        std::env::var("GUARD_SESSION_DB").unwrap_or_else(|_| "./guard_sessions.db".to_string());
    let session_store = Arc::new(SqliteSessionStore::open(&session_db_path)?);
    tracing::info!("session store opened at {session_db_path}");

    let http = reqwest::Client::new();

    // SMTP config for email notifications (optional)
    let smtp_config = SmtpConfig {
        host: std::env::var("GUARD_SMTP_HOST").ok(),
        port: std::env::var("GUARD_SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587),
        user: std::env::var("GUARD_SMTP_USER").ok(),
        pass: std::env::var("GUARD_SMTP_PASS").ok(),
        from: std::env::var("GUARD_SMTP_FROM")
            .unwrap_or_else(|_| "guard@localhost".to_string()),
    };
    let alerts = Arc::new(AlertDispatcher::new(
        http.clone(),
        config.alerts.channels.clone(),
        smtp_config,
    ));

    let readiness = Arc::new(HttpReadinessCheck::new(
        http.clone(),
        &config.service.base_url,
        &config.service.readiness_path,
        Duration::from_secs(config.service.probe_timeout_secs),
    ));
    let probe = Arc::new(ServiceHealthProbe::new(readiness, config.probe_config()));

    let control_plane = Arc::new(HttpControlPlane::new(
        http.clone(),
        config.control_plane.base_url.clone(),
        Duration::from_secs(config.control_plane.timeout_secs),
    ));
    let switcher = Arc::new(VersionSwitcher::new(
        control_plane,
        probe.clone(),
        config.switcher_config(),
    ));

    let migrations = SchemaMigrationCoordinator::new(Arc::new(HttpMigrationTool::new(
        http.clone(),
        config.migration.base_url.clone(),
        Duration::from_secs(config.migration.timeout_secs),
    )));

    let metrics = Arc::new(HttpMetricsProvider::new(
        http.clone(),
        config.metrics.url.clone(),
        Duration::from_secs(config.metrics.timeout_secs),
    ));

    let cache = Arc::new(HttpCacheInvalidator::new(
        http.clone(),
        config.cache.flush_url.clone(),
        Duration::from_secs(config.cache.timeout_secs),
    ));

    let sessions = Arc::new(SessionPreservationManager::new(
        session_store,
        config.session_config(),
    ));

    let controller = Arc::new(RollbackController::new(
        state_db,
        sessions,
        switcher,
        migrations,
        cache,
        metrics,
        probe,
        alerts,
        config.controller_config(),
    ));

    let state = AppState {
        controller: controller.clone(),
    };

    let app = Router::new()
        // Deploy + rollback control
        .route("/api/v1/deploys", post(handlers::deploys::create_deploy))
        .route("/api/v1/rollback", post(handlers::deploys::trigger_rollback))
        .route(
            "/api/v1/rollback/ack",
            post(handlers::deploys::acknowledge_rollback),
        )
        // Status surface
        .route("/api/v1/rollback/status", get(handlers::status::get_status))
        .route("/api/v1/rollback/events", get(handlers::status::list_events))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("GUARD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("guard-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(controller))
        .await?;

    Ok(())
}

async fn shutdown_signal(controller: Arc<RollbackController>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, joining monitor task");
    controller.shutdown().await;
}
