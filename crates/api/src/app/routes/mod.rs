use axum::{
    Router,
    routing::{get, post},
};

pub mod external;
pub mod jobs;
pub mod system;

/// Router for every endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/jobs", jobs::router())
        .route("/external/send-email", post(external::send_email))
}
