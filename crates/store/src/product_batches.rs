//! Records for the user-visible product batches.
//!
//! Layout:
//! - `product_batch:<batch_id>` hash with progress counters plus per-product
//!   `remote_batch:<product_id>` / `error:<product_id>` fields.
//! - `product_batch:<batch_id>:products` set of product ids.
//! - `product:<batch_id>:<product_id>` serialized product blob, updated in
//!   place once a classification code was determined.
//! - `product_batches:{active,completed,failed}` sorted sets by time.

use {
    crate::{Error, RedisResultExt as _, Result, TtlSchedule, score, ttl_secs},
    chrono::Utc,
    model::product::{ProductBatch, ProductBatchState},
    redis::{AsyncCommands as _, aio::ConnectionManager},
    std::collections::HashMap,
};

const ACTIVE: &str = "product_batches:active";
const COMPLETED: &str = "product_batches:completed";
const FAILED: &str = "product_batches:failed";

fn batch_key(batch_id: &str) -> String {
    format!("product_batch:{batch_id}")
}

fn products_key(batch_id: &str) -> String {
    format!("product_batch:{batch_id}:products")
}

fn product_key(batch_id: &str, product_id: &str) -> String {
    format!("product:{batch_id}:{product_id}")
}

#[derive(Clone)]
pub struct ProductBatchStore {
    conn: ConnectionManager,
    ttls: TtlSchedule,
}

impl ProductBatchStore {
    pub(crate) fn new(conn: ConnectionManager, ttls: TtlSchedule) -> Self {
        Self { conn, ttls }
    }

    /// Creates the batch record and all product blobs in one atomic
    /// pipeline.
    pub async fn create(
        &self,
        batch_id: &str,
        products: &[(String, serde_json::Value)],
    ) -> Result<()> {
        let now = Utc::now();
        let ttl = ttl_secs(self.ttls.pending);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            batch_key(batch_id),
            &[
                ("status", ProductBatchState::Pending.to_string()),
                ("created_at", score(now).to_string()),
                ("updated_at", score(now).to_string()),
                ("product_count", products.len().to_string()),
                ("processed_count", "0".to_string()),
                ("completed", "false".to_string()),
            ],
        )
        .ignore();
        pipe.zadd(ACTIVE, batch_id, score(now)).ignore();
        pipe.expire(batch_key(batch_id), ttl).ignore();
        for (product_id, product) in products {
            let key = product_key(batch_id, product_id);
            pipe.set(&key, product.to_string()).ignore();
            pipe.expire(&key, ttl).ignore();
            pipe.sadd(products_key(batch_id), product_id).ignore();
        }
        pipe.expire(products_key(batch_id), ttl).ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .op("product_batch_create")?;
        Ok(())
    }

    pub async fn mark_processing(&self, batch_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                batch_key(batch_id),
                "status",
                ProductBatchState::Processing.to_string(),
            )
            .await
            .op("product_batch_mark_processing")?;
        Ok(())
    }

    /// Remembers which remote batch a product was submitted under.
    pub async fn record_remote_batch(
        &self,
        batch_id: &str,
        product_id: &str,
        remote_batch_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(
                batch_key(batch_id),
                format!("remote_batch:{product_id}"),
                remote_batch_id,
            )
            .await
            .op("product_batch_record_remote")?;
        Ok(())
    }

    /// Stores the classified product and bumps the progress counter.
    pub async fn record_product_result(
        &self,
        batch_id: &str,
        product_id: &str,
        product: &serde_json::Value,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(product_key(batch_id, product_id), product.to_string())
            .ignore();
        pipe.expire(
            product_key(batch_id, product_id),
            ttl_secs(self.ttls.pending),
        )
        .ignore();
        pipe.hincr(batch_key(batch_id), "processed_count", 1).ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .op("product_batch_record_result")?;
        Ok(())
    }

    /// Records a per-product failure; the product still counts as processed.
    pub async fn record_product_error(
        &self,
        batch_id: &str,
        product_id: &str,
        error: &str,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(batch_key(batch_id), format!("error:{product_id}"), error)
            .ignore();
        pipe.hincr(batch_key(batch_id), "processed_count", 1).ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .op("product_batch_record_error")?;
        Ok(())
    }

    /// Moves the batch into a terminal state and between the active and
    /// terminal indices, adjusting TTLs to the terminal schedule.
    pub async fn finish(&self, batch_id: &str, error: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let (state, queue, ttl) = match error {
            None => (
                ProductBatchState::Completed,
                COMPLETED,
                ttl_secs(self.ttls.completed),
            ),
            Some(_) => (ProductBatchState::Failed, FAILED, ttl_secs(self.ttls.failed)),
        };
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut updates = vec![
            ("status", state.to_string()),
            ("completed", "true".to_string()),
            ("updated_at", score(now).to_string()),
        ];
        if let Some(error) = error {
            updates.push(("error", error.to_string()));
        }
        pipe.hset_multiple(batch_key(batch_id), &updates).ignore();
        pipe.zrem(ACTIVE, batch_id).ignore();
        pipe.zadd(queue, batch_id, score(now)).ignore();
        pipe.expire(batch_key(batch_id), ttl).ignore();
        pipe.expire(products_key(batch_id), ttl).ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .op("product_batch_finish")?;
        Ok(())
    }

    pub async fn get(&self, batch_id: &str, include_products: bool) -> Result<Option<ProductBatch>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(batch_key(batch_id))
            .await
            .op("product_batch_get")?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut batch = parse_batch(batch_id, &fields)?;
        if include_products && batch.completed {
            let product_ids: Vec<String> = conn
                .smembers(products_key(batch_id))
                .await
                .op("product_batch_get")?;
            let mut products = Vec::with_capacity(product_ids.len());
            for product_id in product_ids {
                let blob: Option<String> = conn
                    .get(product_key(batch_id, &product_id))
                    .await
                    .op("product_batch_get")?;
                let Some(blob) = blob else { continue };
                match serde_json::from_str(&blob) {
                    Ok(product) => products.push(product),
                    Err(err) => {
                        tracing::warn!(batch_id, product_id, ?err, "unreadable product blob");
                    }
                }
            }
            batch.products = Some(products);
        }
        Ok(Some(batch))
    }
}

fn parse_batch(batch_id: &str, fields: &HashMap<String, String>) -> Result<ProductBatch> {
    let malformed = |reason: String| Error::Malformed {
        key: batch_key(batch_id),
        reason,
    };
    let status: ProductBatchState = fields
        .get("status")
        .ok_or_else(|| malformed("missing field status".to_string()))?
        .parse()
        .map_err(|_| malformed("unknown status".to_string()))?;
    let count = |name: &str| {
        fields
            .get(name)
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|err| malformed(format!("bad counter {name}: {err}")))
            .map(Option::unwrap_or_default)
    };
    Ok(ProductBatch {
        batch_id: batch_id.to_string(),
        status,
        product_count: count("product_count")?,
        processed_count: count("processed_count")?,
        completed: fields.get("completed").map(String::as_str) == Some("true"),
        error: fields.get("error").cloned(),
        products: None,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::Store, serde_json::json};

    async fn store() -> Store {
        Store::connect("redis://localhost:6379", TtlSchedule::default())
            .await
            .unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    #[ignore]
    async fn batch_progress_round_trip() {
        let store = store().await;
        let batches = store.product_batches();
        let batch_id = unique("product_batch");
        let products = vec![
            ("p1".to_string(), json!({"title": "AAA battery"})),
            ("p2".to_string(), json!({"title": "AA battery"})),
        ];
        batches.create(&batch_id, &products).await.unwrap();

        let created = batches.get(&batch_id, false).await.unwrap().unwrap();
        assert_eq!(created.status, ProductBatchState::Pending);
        assert_eq!(created.product_count, 2);
        assert_eq!(created.processed_count, 0);
        assert!(!created.completed);

        batches.mark_processing(&batch_id).await.unwrap();
        batches
            .record_product_result(&batch_id, "p1", &json!({"title": "AAA battery", "code": "27.20.23.000-00000001"}))
            .await
            .unwrap();
        batches
            .record_product_error(&batch_id, "p2", "request timed out")
            .await
            .unwrap();
        batches.finish(&batch_id, None).await.unwrap();

        let finished = batches.get(&batch_id, true).await.unwrap().unwrap();
        assert_eq!(finished.status, ProductBatchState::Completed);
        assert_eq!(finished.processed_count, 2);
        assert!(finished.completed);
        let products = finished.products.unwrap();
        assert_eq!(products.len(), 2);
        assert!(products.iter().any(|product| product["code"] == "27.20.23.000-00000001"));
    }

    #[tokio::test]
    #[ignore]
    async fn failed_batch_carries_error() {
        let store = store().await;
        let batches = store.product_batches();
        let batch_id = unique("product_batch");
        batches
            .create(&batch_id, &[("p1".to_string(), json!({}))])
            .await
            .unwrap();
        batches
            .finish(&batch_id, Some("store unavailable"))
            .await
            .unwrap();

        let batch = batches.get(&batch_id, false).await.unwrap().unwrap();
        assert_eq!(batch.status, ProductBatchState::Failed);
        assert_eq!(batch.error.as_deref(), Some("store unavailable"));

        assert!(batches.get(&unique("product_batch"), false).await.unwrap().is_none());
    }
}
