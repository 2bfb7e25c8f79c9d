use axum::{http::{HeaderValue, Method}, routing::get, Extension, Router};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{directory::Directory, error::{config, AppResult}, state::Registry, utils::jwt::Secret};

pub mod health;
pub mod ws;

const BODY_LIMIT: usize = 64 * 1024;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::health))
        .nest("/ws",      ws::router())
}

/// The whole relay surface with its shared state attached.
pub fn app(secret: &str, cors_origin: &str, rooms: Registry, dir: Directory) -> AppResult<Router> {
    let origin: HeaderValue = cors_origin.parse().map_err(config)?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true);

    Ok(router()
        .layer(Extension(Secret::new(secret)))
        .layer(Extension(rooms))
        .layer(Extension(dir))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}
