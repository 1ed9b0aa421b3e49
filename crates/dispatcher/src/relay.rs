//! The outbox relay: drains due notifications, signs them and POSTs them to
//! the caller's webhook. Delivery is at-least-once; receivers must be
//! idempotent.

use {
    anyhow::{Context as _, Result},
    chrono::Utc,
    futures::StreamExt as _,
    hmac::Mac as _,
    model::outbox::{OutboxMessage, TerminalStatus},
    rand::Rng as _,
    std::{num::NonZeroUsize, time::Duration},
    store::outbox::OutboxStore,
    tokio::sync::watch,
};

/// Included in failure records; response bodies can be arbitrarily large.
const ERROR_BODY_LIMIT: usize = 200;

pub struct Relay {
    outbox: OutboxStore,
    client: reqwest::Client,
    /// Target for messages that do not carry their own callback url.
    callback_url: String,
    callback_secret: String,
    request_timeout: Duration,
    batch_size: usize,
    concurrency: NonZeroUsize,
    poll_interval: Duration,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outbox: OutboxStore,
        client: reqwest::Client,
        callback_url: String,
        callback_secret: String,
        request_timeout: Duration,
        batch_size: usize,
        concurrency: NonZeroUsize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            outbox,
            client,
            callback_url,
            callback_secret,
            request_timeout,
            batch_size,
            concurrency,
            poll_interval,
        }
    }

    pub async fn run_forever(self, mut stop: watch::Receiver<bool>) {
        while !*stop.borrow() {
            let delay = match self.single_cycle().await {
                Ok(()) => self.poll_interval,
                Err(err) => {
                    tracing::error!(?err, "relay cycle failed");
                    self.poll_interval * 2
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = stop.changed() => (),
            }
        }
        tracing::info!("relay loop stopped");
    }

    /// One claim-and-deliver round through a bounded worker pool.
    pub async fn single_cycle(&self) -> Result<()> {
        let due = self
            .outbox
            .claim(self.batch_size, Utc::now())
            .await
            .context("claim due messages")?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = due.len(), "delivering notifications");
        futures::stream::iter(due)
            .for_each_concurrent(self.concurrency.get(), |message| async move {
                let message_id = message.message_id.clone();
                if let Err(err) = self.deliver(message).await {
                    tracing::error!(?err, message = message_id, "failed to process message");
                }
            })
            .await;
        Ok(())
    }

    async fn deliver(&self, message: OutboxMessage) -> Result<()> {
        let body = serde_json::to_vec(&callback_body(&message)).context("serialize body")?;
        let signature = sign(&self.callback_secret, &body);
        let url = message
            .callback_url
            .clone()
            .unwrap_or_else(|| self.callback_url.clone());
        let sent = self
            .client
            .post(&url)
            .timeout(jittered(self.request_timeout))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Signature", signature)
            .body(body)
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {
                self.outbox
                    .mark_sent(&message.message_id)
                    .await
                    .context("mark sent")?;
                tracing::info!(message = message.message_id, url, "notification delivered");
                Metrics::get().deliveries.with_label_values(&["delivered"]).inc();
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = format!(
                    "http status {}: {}",
                    status.as_u16(),
                    body.chars().take(ERROR_BODY_LIMIT).collect::<String>()
                );
                self.delivery_failed(&message, &error).await?;
            }
            Err(err) => {
                self.delivery_failed(&message, &format!("request error: {err}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delivery_failed(&self, message: &OutboxMessage, error: &str) -> Result<()> {
        tracing::warn!(
            message = message.message_id,
            retry_count = message.retry_count,
            error,
            "notification delivery failed"
        );
        self.outbox
            .mark_failed(&message.message_id, error)
            .await
            .context("mark failed")?;
        Metrics::get().deliveries.with_label_values(&["failed"]).inc();
        Ok(())
    }
}

/// The webhook body: `{task_id, document_id, status}` plus the
/// status-specific payload fields at top level.
pub fn callback_body(message: &OutboxMessage) -> serde_json::Value {
    let mut body = serde_json::json!({
        "task_id": message.task_id,
        "document_id": message.document_id,
        "status": message.status.to_string(),
    });
    match message.status {
        TerminalStatus::Completed => {
            for field in ["result", "processing_time", "input_tokens", "output_tokens"] {
                if let Some(value) = message.payload.get(field) {
                    body[field] = value.clone();
                }
            }
        }
        TerminalStatus::Failed => {
            body["error"] = message
                .payload
                .get("error")
                .cloned()
                .unwrap_or_else(|| serde_json::json!("unknown error"));
        }
    }
    body
}

/// Hex HMAC-SHA256 of the raw body bytes, sent as `X-Signature`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Uniform jitter in [0.8, 1.2] per attempt, so retries of many receivers
/// do not synchronize on the timeout boundary.
fn jittered(timeout: Duration) -> Duration {
    timeout.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Webhook deliveries by outcome.
    #[metric(labels("outcome"))]
    deliveries: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn message(status: TerminalStatus, payload: serde_json::Value) -> OutboxMessage {
        OutboxMessage {
            message_id: "m1".to_string(),
            task_id: "t1".to_string(),
            document_id: "d1".to_string(),
            status,
            payload,
            callback_url: None,
            created_at: Utc::now(),
            sent_at: None,
            retry_count: 0,
            next_retry_at: Utc::now(),
            last_error: None,
        }
    }

    #[test]
    fn completed_body_lifts_payload_fields_to_top_level() {
        let message = message(
            TerminalStatus::Completed,
            json!({
                "result": "26.30.11.150-00000123",
                "processing_time": 90.0,
                "input_tokens": 420,
                "output_tokens": 18,
            }),
        );
        assert_eq!(
            callback_body(&message),
            json!({
                "task_id": "t1",
                "document_id": "d1",
                "status": "completed",
                "result": "26.30.11.150-00000123",
                "processing_time": 90.0,
                "input_tokens": 420,
                "output_tokens": 18,
            })
        );
    }

    #[test]
    fn completed_body_omits_absent_optional_fields() {
        let message = message(TerminalStatus::Completed, json!({"result": "ok"}));
        assert_eq!(
            callback_body(&message),
            json!({
                "task_id": "t1",
                "document_id": "d1",
                "status": "completed",
                "result": "ok",
            })
        );
    }

    #[test]
    fn failed_body_carries_the_error() {
        let message1 = message(TerminalStatus::Failed, json!({"error": "bad model"}));
        assert_eq!(
            callback_body(&message1),
            json!({
                "task_id": "t1",
                "document_id": "d1",
                "status": "failed",
                "error": "bad model",
            })
        );

        let message2 = message(TerminalStatus::Failed, json!({}));
        assert_eq!(callback_body(&message2)["error"], json!("unknown error"));
    }

    #[test]
    fn signature_matches_known_vector() {
        // RFC 4231-style check of the signing primitive.
        assert_eq!(
            sign("key", b"The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_covers_raw_body_bytes() {
        let message = message(TerminalStatus::Completed, json!({"result": "ok"}));
        let body = serde_json::to_vec(&callback_body(&message)).unwrap();
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(b"hush").unwrap();
        mac.update(&body);
        assert_eq!(sign("hush", &body), hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let timeout = Duration::from_secs(300);
        for _ in 0..1_000 {
            let jittered = jittered(timeout);
            assert!(jittered >= timeout.mul_f64(0.8));
            assert!(jittered <= timeout.mul_f64(1.2));
        }
    }
}
