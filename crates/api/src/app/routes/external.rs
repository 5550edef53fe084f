//! Stand-in for the third-party email service, so `send_email` jobs can run
//! locally. Fails at the configured rate.

use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use tracing::{info, warn};

use crate::app::errors;
use crate::app::services::AppServices;

/// `POST /external/send-email`
pub async fn send_email(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    if rand::random::<f64>() < services.external_failure_rate {
        warn!(to = %body["to"], "mock email service failing on purpose");
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream_failure",
            "random failure",
        );
    }

    info!(to = %body["to"], subject = %body["subject"], "mock email sent");
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "email sent" })),
    )
        .into_response()
}
