//! The product-batch flow: a user-visible batch of up to 100 products, each
//! classified through its own single-request remote batch. Unlike the task
//! flow there is no durable state machine per product; one background job
//! drives the whole batch to completion and records progress counters.

use {
    anyhow::{Context as _, Result},
    batch_api::BatchApi,
    model::batch::ResultEntry,
    std::{sync::Arc, time::Duration},
    store::product_batches::ProductBatchStore,
};

const PRODUCT_PROMPT_TEMPLATE: &str = "I will give you a JSON document describing a product. \
     Determine the single exact catalog classification code for it. Consider the title, \
     description, category and attributes, and pay attention to the product type, size and \
     technical characteristics. Codes have the format XX.XX.XX.XXX-XXXXXXXX. If you cannot \
     determine one code with high confidence, reply only with \"code not found\"; otherwise \
     reply only with the code.\n\nProduct JSON: {product_json}";

/// The model's answer when it cannot classify the product.
const NOT_FOUND_ANSWER: &str = "code not found";

/// Polls of a single product's remote batch before giving up on it.
const MAX_POLLS: u32 = 30;
const INITIAL_POLL_DELAY: Duration = Duration::from_secs(2);
const MAX_POLL_DELAY: Duration = Duration::from_secs(60);

pub struct ProductFlow {
    batches: ProductBatchStore,
    api: Arc<dyn BatchApi>,
}

impl ProductFlow {
    pub fn new(batches: ProductBatchStore, api: Arc<dyn BatchApi>) -> Self {
        Self { batches, api }
    }

    /// Registers the batch and spawns its background processing. Products
    /// must be JSON objects (the API surface validates this).
    pub async fn start_batch(
        self: Arc<Self>,
        products: Vec<serde_json::Value>,
    ) -> Result<String> {
        let batch_id = format!("product_batch_{}", uuid::Uuid::new_v4());
        let keyed: Vec<(String, serde_json::Value)> = products
            .into_iter()
            .map(|product| (product_id(&product), product))
            .collect();
        self.batches
            .create(&batch_id, &keyed)
            .await
            .context("create product batch")?;
        tracing::info!(batch = batch_id, count = keyed.len(), "created product batch");
        let flow = self.clone();
        let spawned_batch_id = batch_id.clone();
        tokio::spawn(async move { flow.process_batch(spawned_batch_id, keyed).await });
        Ok(batch_id)
    }

    async fn process_batch(&self, batch_id: String, products: Vec<(String, serde_json::Value)>) {
        if let Err(err) = self.batches.mark_processing(&batch_id).await {
            tracing::error!(?err, batch = batch_id, "failed to start product batch");
            let _ = self.batches.finish(&batch_id, Some(&err.to_string())).await;
            return;
        }
        for (product_id, product) in &products {
            if let Err(err) = self.process_product(&batch_id, product_id, product).await {
                tracing::warn!(?err, batch = batch_id, product = product_id, "product failed");
                if let Err(err) = self
                    .batches
                    .record_product_error(&batch_id, product_id, &err.to_string())
                    .await
                {
                    tracing::error!(?err, batch = batch_id, "failed to record product error");
                }
            }
        }
        match self.batches.finish(&batch_id, None).await {
            Ok(()) => tracing::info!(batch = batch_id, "product batch finished"),
            Err(err) => tracing::error!(?err, batch = batch_id, "failed to finish product batch"),
        }
    }

    async fn process_product(
        &self,
        batch_id: &str,
        product_id: &str,
        product: &serde_json::Value,
    ) -> Result<()> {
        let prompt = PRODUCT_PROMPT_TEMPLATE.replace("{product_json}", &product.to_string());
        let created = self
            .api
            .create_batch(product_id, &prompt)
            .await
            .context("submit product")?;
        self.batches
            .record_remote_batch(batch_id, product_id, &created.batch_id)
            .await
            .context("record remote batch")?;
        let code = self.wait_for_code(&created.batch_id, product_id).await;
        tracing::info!(batch = batch_id, product = product_id, ?code, "product classified");
        let mut classified = product.clone();
        classified["classification_code"] = match code {
            Some(code) => serde_json::Value::String(code),
            None => serde_json::Value::Null,
        };
        self.batches
            .record_product_result(batch_id, product_id, &classified)
            .await
            .context("record product result")?;
        Ok(())
    }

    /// Polls the product's remote batch until it ends, backing off 1.5× per
    /// poll. None when no valid code was determined.
    async fn wait_for_code(&self, remote_batch_id: &str, product_id: &str) -> Option<String> {
        let mut delay = INITIAL_POLL_DELAY;
        for _ in 0..MAX_POLLS {
            match self.api.batch_status(remote_batch_id).await {
                Ok(info) if info.state.is_ended() => {
                    return self.extract_code(remote_batch_id, product_id).await;
                }
                Ok(_) => (),
                Err(err) => {
                    tracing::warn!(?err, batch = remote_batch_id, "product batch poll failed");
                }
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(1.5).min(MAX_POLL_DELAY);
        }
        tracing::error!(
            batch = remote_batch_id,
            product = product_id,
            "gave up waiting for the product result"
        );
        None
    }

    async fn extract_code(&self, remote_batch_id: &str, product_id: &str) -> Option<String> {
        let results = match self.api.batch_results(remote_batch_id).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(?err, batch = remote_batch_id, "fetching product result failed");
                return None;
            }
        };
        let Some(entry) = results.into_iter().find(|item| item.custom_id == product_id) else {
            tracing::error!(
                batch = remote_batch_id,
                product = product_id,
                "product result missing from its batch"
            );
            return None;
        };
        match entry.result {
            ResultEntry::Succeeded { text, .. } => {
                let answer = text.trim();
                if answer == NOT_FOUND_ANSWER {
                    None
                } else if is_valid_code(answer) {
                    Some(answer.to_string())
                } else {
                    tracing::warn!(
                        product = product_id,
                        answer,
                        "unexpected answer format for product"
                    );
                    None
                }
            }
            ResultEntry::Errored { message } => {
                tracing::warn!(product = product_id, message, "product request errored");
                None
            }
            ResultEntry::Other { kind } => {
                tracing::warn!(product = product_id, kind, "product request did not succeed");
                None
            }
        }
    }
}

/// Stable id of a product within its batch: the caller-supplied object id
/// when present, a fresh one otherwise.
pub fn product_id(product: &serde_json::Value) -> String {
    for key in ["mongo_id", "_id"] {
        if let Some(oid) = product
            .get(key)
            .and_then(|id| id.get("$oid"))
            .and_then(serde_json::Value::as_str)
        {
            return oid.to_string();
        }
    }
    format!("product_{}", uuid::Uuid::new_v4())
}

/// Classification codes look like `26.30.11.150-00000123`: four dotted
/// digit groups of 2.2.2.3, a dash and an 8-digit suffix.
pub fn is_valid_code(code: &str) -> bool {
    let Some((prefix, suffix)) = code.split_once('-') else {
        return false;
    };
    let all_digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
    let groups: Vec<&str> = prefix.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .zip([2, 2, 2, 3])
            .all(|(group, len)| group.len() == len && all_digits(group))
        && suffix.len() == 8
        && all_digits(suffix)
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn valid_codes() {
        assert!(is_valid_code("26.30.11.150-00000123"));
        assert!(is_valid_code("27.20.23.000-00000001"));
    }

    #[test]
    fn invalid_codes() {
        for code in [
            "",
            "code not found",
            "26.30.11.150",
            "26.30.11-00000123",
            "26.30.11.150-123",
            "26.30.11.150-0000012x",
            "2a.30.11.150-00000123",
            "26.30.11.1500-00000123",
        ] {
            assert!(!is_valid_code(code), "{code}");
        }
    }

    #[test]
    fn product_id_prefers_caller_ids() {
        assert_eq!(
            product_id(&json!({"mongo_id": {"$oid": "abc123"}})),
            "abc123"
        );
        assert_eq!(product_id(&json!({"_id": {"$oid": "def456"}})), "def456");
        // mongo_id wins over the legacy field.
        assert_eq!(
            product_id(&json!({"mongo_id": {"$oid": "new"}, "_id": {"$oid": "old"}})),
            "new"
        );
    }

    #[test]
    fn product_id_generates_one_when_absent() {
        let id = product_id(&json!({"title": "AAA battery"}));
        assert!(id.starts_with("product_"));
        // And it is unique per call.
        assert_ne!(id, product_id(&json!({"title": "AAA battery"})));
    }
}
