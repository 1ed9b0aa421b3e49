//! Product-batch endpoints: create a batch of up to 100 products, poll its
//! progress.

use {
    super::{ApiError, AppContext},
    axum::{
        Json,
        extract::{Path, Query, State},
        http::StatusCode,
    },
    model::product::{ProductBatch, ProductBatchState},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ProductBatchRequest {
    pub products: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ProductBatchResponse {
    pub batch_id: String,
    pub status: ProductBatchState,
    pub product_count: u64,
    pub processed_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct BatchStatusQuery {
    #[serde(default)]
    pub include_products: bool,
}

pub async fn submit_batch(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ProductBatchRequest>,
) -> Result<(StatusCode, Json<ProductBatchResponse>), ApiError> {
    validate(&request.products).map_err(ApiError::bad_request)?;
    let product_count = request.products.len() as u64;
    let batch_id = ctx
        .products
        .clone()
        .start_batch(request.products)
        .await
        .map_err(|err| ApiError::internal(format!("failed to create product batch: {err}")))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProductBatchResponse {
            batch_id,
            status: ProductBatchState::Pending,
            product_count,
            processed_count: 0,
        }),
    ))
}

pub async fn batch_status(
    State(ctx): State<Arc<AppContext>>,
    Path(batch_id): Path<String>,
    Query(query): Query<BatchStatusQuery>,
) -> Result<Json<ProductBatch>, ApiError> {
    let batch = ctx
        .store
        .product_batches()
        .get(&batch_id, query.include_products)
        .await
        .map_err(|err| ApiError::internal(format!("failed to load product batch: {err}")))?
        .ok_or_else(|| ApiError::not_found(format!("batch {batch_id} not found")))?;
    Ok(Json(batch))
}

/// A batch must hold 1..=100 products, each a JSON object.
pub fn validate(products: &[serde_json::Value]) -> Result<(), String> {
    if products.is_empty() {
        return Err("products must not be empty".to_string());
    }
    if products.len() > MAX_BATCH_SIZE {
        return Err(format!(
            "too many products in batch, the maximum is {MAX_BATCH_SIZE}"
        ));
    }
    if let Some(at) = products.iter().position(|product| !product.is_object()) {
        return Err(format!("product at index {at} is not an object"));
    }
    Ok(())
}
