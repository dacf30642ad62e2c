// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use anyhow::Context;
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::alarm_types::AlarmTypeRegistry;
use crate::application::analytics_service::AnalyticsService;
use crate::application::playback_stream::PlaybackStreamService;
use crate::application::session_service::SessionService;
use crate::application::trace_repository::TraceRepository;
use crate::infrastructure::config::{load_app_config, AppConfig, SourceKind};
use crate::infrastructure::influx_repository::InfluxRepository;
use crate::infrastructure::json_repository::JsonFileRepository;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::router;

fn build_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn TraceRepository>> {
    let source = &config.source;
    let regions_file = source
        .regions_file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&source.data_dir).join("regions.geojson"));

    let repository: Arc<dyn TraceRepository> = match source.kind {
        SourceKind::Files => {
            Arc::new(JsonFileRepository::new(&source.data_dir, Some(regions_file)))
        }
        SourceKind::Influx => {
            let influx = source
                .influx
                .clone()
                .context("source.kind = \"influx\" requires a [source.influx] section")?;
            Arc::new(InfluxRepository::new(
                influx.host,
                influx.token,
                influx.database,
                influx.retention_policy,
                source.alarm_types.clone(),
                regions_file,
            ))
        }
    };
    Ok(repository)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_app_config().context("Failed to load configuration")?;

    // Infrastructure
    let repository = build_repository(&config)?;

    // Application
    let session = SessionService::load(repository, &config).await?;
    let playback_service = PlaybackStreamService::new(session.clone());
    let analytics_service = AnalyticsService::new(session.clone(), config.analytics.clone());
    let alarm_types = AlarmTypeRegistry::new(config.source.alarm_types.clone());

    let state = Arc::new(AppState {
        session,
        playback_service,
        analytics_service,
        alarm_types,
    });

    // Presentation. Responses are compressed per chunk by hand, so no CompressionLayer.
    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!("Invalid listen address {}:{}", config.server.host, config.server.port)
        })?;
    tracing::info!("Starting haul-replay service on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
