use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Caller-supplied request context, taken from headers.
///
/// Values are passed through raw; the job services decide what counts as a
/// missing tenant or an absent key. Non-UTF-8 header values are treated as
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    tenant_id: Option<String>,
    idempotency_key: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            tenant_id: header(TENANT_HEADER),
            idempotency_key: header(IDEMPOTENCY_HEADER),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
