use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use jobforge_infra::jobs::EnqueueRequest;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    // POST takes a job type, GET a job id; the path shapes coincide.
    Router::new().route("/:segment", post(enqueue_job).get(get_job))
}

/// `POST /jobs/{type}`
pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    ctx: RequestContext,
    Path(job_type): Path<String>,
    body: Bytes,
) -> axum::response::Response {
    // An unparseable body is reported by payload validation, after the tenant check.
    let payload = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

    let req = EnqueueRequest {
        tenant_id: ctx.tenant_id().map(str::to_string),
        idempotency_key: ctx.idempotency_key().map(str::to_string),
        job_type,
        payload,
    };

    match services.enqueue.enqueue(req).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": receipt.job_id.to_string(),
                "status": receipt.status_label(),
            })),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// `GET /jobs/{id}`
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> axum::response::Response {
    match services.status.get_status(ctx.tenant_id(), &id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
