//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, worker client, orchestrator)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: services::AppServices, api_token: Option<String>) -> Router {
    let auth_state = middleware::AuthState { token: api_token };

    let protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                auth_state,
                middleware::auth_middleware,
            ))
            .layer(Extension(Arc::new(services))),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
