use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use jobforge_core::DomainError;
use jobforge_infra::jobs::JobServiceError;

pub fn service_error_to_response(err: JobServiceError) -> axum::response::Response {
    match err {
        JobServiceError::Domain(DomainError::MissingTenant) => json_error(
            StatusCode::BAD_REQUEST,
            "missing_tenant",
            "X-Tenant-Id header is required",
        ),
        JobServiceError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        JobServiceError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", msg)
        }
        JobServiceError::Domain(DomainError::NotFound) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
        }
        JobServiceError::Store(e) => {
            error!(error = %e, "job store error");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                "failed to access job store",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
