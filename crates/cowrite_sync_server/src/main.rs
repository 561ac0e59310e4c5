use std::sync::Arc;

use axum::http::{Method, header};
use chrono::{TimeDelta, Utc};
use cowrite_sync_server::{
    config::Config,
    handlers::AppState,
    rate_limit::ChatRateLimiter,
    rooms::RoomRegistry,
    routes,
};
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowrite_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Cowrite Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("CORS origins: {:?}", config.cors_origins);
    info!(
        "Room capacity: {}, history limit: {}, idle expiry: {}s",
        config.room_capacity, config.history_limit, config.idle_expiry_secs
    );

    let registry = Arc::new(RoomRegistry::new(config.room_capacity, config.history_limit));
    let rate_limiter = ChatRateLimiter::new();

    let state = AppState {
        registry: registry.clone(),
        rate_limiter: rate_limiter.clone(),
        config: config.clone(),
    };

    // Build CORS layer
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::list(origins));

    let app = routes(state).layer(cors).layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Start idle-room eviction task
    {
        let registry = registry.clone();
        let interval_secs = config.eviction_interval_secs;
        let expiry = TimeDelta::seconds(config.idle_expiry_secs as i64);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                registry.evict_idle(Utc::now(), expiry).await;
            }
        });
    }

    // Start rate-limiter cleanup task
    {
        let rate_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                rate_limiter.prune(std::time::Duration::from_secs(600));
            }
        });
    }

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    // Tell connected clients their rooms are gone before the process exits.
    registry.close_all().await;
    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
