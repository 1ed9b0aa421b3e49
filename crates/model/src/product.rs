use serde::{Deserialize, Serialize};

/// State of a user-visible product batch. Unlike tasks, product batches are
/// processed to completion by a single background job, so there is no
/// in-flight state to resume.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductBatchState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Progress view of a product batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductBatch {
    pub batch_id: String,
    pub status: ProductBatchState,
    pub product_count: u64,
    pub processed_count: u64,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Only populated on request and only once the batch is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<serde_json::Value>>,
}
