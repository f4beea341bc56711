use axum::{routing::post, Router};

pub mod progress;
pub mod recovery;
pub mod retry_queue;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/sync-recovery", post(recovery::run_recovery))
        .nest("/progress", progress::router())
        .nest("/retry-queue", retry_queue::router())
}
