use axum::http::{header, Method};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_gateway::config::Settings;
use courier_gateway::services::{
    DevTokenVerifier, IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
    StaticPrincipalResolver,
};
use courier_gateway::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Arc::new(Settings::new()?);

    tracing::info!("Starting courier gateway...");

    // Redis backs the idempotency replay store; a failed connection in
    // development degrades to the in-memory store so the local stack runs
    // without infrastructure.
    let mut redis: Option<redis::aio::ConnectionManager> = None;
    let client = redis::Client::open(settings.redis.url.clone())?;
    let idempotency: Arc<dyn IdempotencyStore> = match client.get_connection_manager().await {
        Ok(manager) => {
            tracing::info!("Redis connection established");
            redis = Some(manager.clone());
            Arc::new(RedisIdempotencyStore::new(manager))
        }
        Err(err) if settings.security.is_development => {
            tracing::warn!(error = %err, "Redis unavailable; using in-memory idempotency store");
            Arc::new(InMemoryIdempotencyStore::new())
        }
        Err(err) => return Err(err.into()),
    };

    // The JWT validator and principal directory are platform collaborators;
    // the local stack runs with the dev shims.
    let state = AppState::new(
        settings.clone(),
        redis,
        idempotency,
        Arc::new(DevTokenVerifier),
        Arc::new(StaticPrincipalResolver::new()),
    );

    let janitors = state.spawn_janitors();
    tracing::info!(count = janitors.len(), "rate limiter janitors started");

    // Build CORS layer for the configured frontend origin
    let cors = CorsLayer::new()
        .allow_origin(
            settings
                .security
                .frontend_url
                .parse::<axum::http::HeaderValue>()?,
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::HeaderName::from_static("x-request-id"),
            header::HeaderName::from_static("idempotency-key"),
            header::HeaderName::from_static("x-idempotency-key"),
        ])
        .allow_credentials(true);

    let app = routes::gateway_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
