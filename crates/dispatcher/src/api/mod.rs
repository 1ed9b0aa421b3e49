//! Inbound HTTP surface. Handlers receive their dependencies through
//! [`AppContext`]; nothing reaches into process-wide state.

pub mod processing;
pub mod products;

use {
    crate::products::ProductFlow,
    axum::{
        Json, Router,
        extract::{Request, State},
        http::{HeaderMap, StatusCode},
        middleware::{self, Next},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    batch_api::BatchApi,
    std::{net::SocketAddr, sync::Arc},
    store::Store,
};

pub struct AppContext {
    pub store: Store,
    pub batch_api: Arc<dyn BatchApi>,
    pub products: Arc<ProductFlow>,
    pub api_key: String,
    pub callback_url: String,
    pub callback_secret: String,
    pub prompt_template: String,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/v1/processing/", post(processing::submit))
        .route("/api/v1/processing/{task_id}", get(processing::status))
        .route("/api/v1/products/batch", post(products::submit_batch))
        .route("/api/v1/products/batch/{batch_id}", get(products::batch_status))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_api_key))
        .with_state(ctx)
}

pub async fn serve(address: SocketAddr, ctx: Arc<AppContext>) {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .expect("failed to bind api endpoint");
    tracing::info!(%address, "serving api");
    axum::serve(listener, app).await.expect("api server failed");
}

async fn require_api_key(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if authorized(request.headers(), &ctx.api_key) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            detail: "invalid api key".to_string(),
        })
    }
}

/// The `X-API-Key` header must match the configured key exactly.
pub fn authorized(headers: &HeaderMap, api_key: &str) -> bool {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        == Some(api_key)
}

/// Error envelope of the API: a status code plus a `{"detail": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(detail, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    #[test]
    fn api_key_header_must_match() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "expected"));

        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(!authorized(&headers, "expected"));

        headers.insert("x-api-key", HeaderValue::from_static("expected"));
        assert!(authorized(&headers, "expected"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("expected"));
        assert!(authorized(&headers, "expected"));
    }
}
