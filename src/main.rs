// src/main.rs
use axum::{Extension, Router};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use reelforge::compose::ffmpeg::{check_ffmpeg_available, SystemRunner};
use reelforge::orchestrator::Orchestrator;
use reelforge::providers::ProviderCatalog;
use reelforge::registry::{ConnectionRegistry, ConnectionStore, PgConnectionStore};
use reelforge::storage::LocalObjectStore;
use reelforge::{db, handlers, middleware, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    // Media root holds stored assets plus the composition scratch space.
    let media_root = PathBuf::from(
        std::env::var("MEDIA_ROOT").unwrap_or_else(|_| "media".to_string()),
    );
    let scratch_root = media_root.join("scratch");
    for dir in [&media_root, &scratch_root] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("Failed to create {}: {}", dir.display(), e);
        }
    }

    if let Err(e) = check_ffmpeg_available() {
        tracing::warn!("{} Composition and clip verification will fail.", e);
    }

    // Create the database connection pool
    let db_pool = db::create_pool()
        .await
        .expect("Failed to create database pool.");

    let presign_secret = std::env::var("PRESIGN_SECRET").unwrap_or_else(|_| {
        tracing::warn!("PRESIGN_SECRET not set, using an ephemeral secret (URLs break on restart)");
        uuid::Uuid::new_v4().to_string()
    });
    let store = Arc::new(LocalObjectStore::new(media_root.clone(), presign_secret));

    // Generation backends come from configuration; missing ones disable the
    // matching stage with a warning.
    let providers = ProviderCatalog::from_env();

    let connection_store: Arc<dyn ConnectionStore> = Arc::new(PgConnectionStore::new(db_pool.clone()));
    let registry = Arc::new(ConnectionRegistry::new(connection_store.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        db_pool.clone(),
        registry.clone(),
        providers,
        store.clone(),
        Arc::new(SystemRunner),
        scratch_root,
    ));

    let shared_state = Arc::new(AppState {
        db_pool,
        registry,
        orchestrator,
        store,
    });

    // Periodically prune connection records that disconnected long ago.
    let prune_store = connection_store.clone();
    tokio::spawn(async move {
        loop {
            match prune_store.prune_stale(24).await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!("🗑️ Pruned {} stale connection records", pruned),
                Err(e) => tracing::warn!("Connection record pruning failed: {}", e),
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        }
    });

    // Build our application with all routes and shared state
    let app = Router::new()
        .merge(handlers::sessions::session_routes())
        .merge(handlers::status_ws::status_routes())
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind listener");
    tracing::info!("listening on {}", listener.local_addr().expect("listener has no address"));
    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,reelforge=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,reelforge=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // JSON logs for aggregation in production, human-readable otherwise.
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 ReelForge starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) { "development" } else { "production" }
    );

    let db_configured = std::env::var("DATABASE_URL").is_ok();
    let script_configured = std::env::var("SCRIPT_PROVIDER_URL").is_ok();
    let image_configured = std::env::var("IMAGE_PROVIDER_URL").is_ok();
    let voice_configured = std::env::var("VOICE_PROVIDER_URL").is_ok();
    let clip_configured = std::env::var("CLIP_PROVIDER_URL").is_ok();

    tracing::info!(
        "Configuration - Database: {}, Script: {}, Image: {}, Voice: {}, Clip: {}",
        if db_configured { "✅" } else { "❌" },
        if script_configured { "✅" } else { "❌" },
        if image_configured { "✅" } else { "❌" },
        if voice_configured { "✅" } else { "❌" },
        if clip_configured { "✅" } else { "❌" }
    );

    Ok(())
}
