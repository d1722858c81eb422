pub mod handlers;
pub mod state;
pub mod url_validation;

use crate::{
    config::Config,
    error::Result,
    hls::link::{KEY_ROUTE, OPAQUE_ROUTE, PLAYLIST_ROUTE, SEGMENT_ROUTE},
    relay::Upstream,
};
use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    response::Response,
    routing::get,
};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

/// Header carrying the relay's crate version on every response
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("x-hls-relay-version");

/// Build the router with a real HTTP upstream
pub fn build_router(config: Config) -> Result<Router> {
    Ok(router(AppState::new(config)?))
}

/// Build the router around a caller-provided upstream
pub fn build_router_with_upstream(config: Config, upstream: Arc<dyn Upstream>) -> Router {
    router(AppState::with_upstream(config, upstream))
}

fn router(state: AppState) -> Router {
    let opaque_route = format!("{OPAQUE_ROUTE}/{{token}}");

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(PLAYLIST_ROUTE, get(handlers::playlist::serve_playlist))
        .route(SEGMENT_ROUTE, get(handlers::segment::serve_segment))
        .route(KEY_ROUTE, get(handlers::segment::serve_key))
        .route(&opaque_route, get(handlers::opaque::serve_opaque))
        .layer(cors_layer())
        .layer(middleware::map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86400))
}

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let app = build_router(config)?;

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Relay listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
