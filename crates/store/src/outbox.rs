//! Durable queue of outbound webhook notifications.
//!
//! Layout:
//! - `outbox:message:<message_id>` hash with the message fields; the payload
//!   is stored serialized.
//! - `outbox:pending` sorted set scored by `next_retry_at`; re-scored on
//!   every failed delivery.
//! - `outbox:sent` sorted set of acknowledged messages.
//! - `outbox:task:<task_id>` / `outbox:document:<document_id>` index sets.

use {
    crate::{
        Error, RedisResultExt as _, Result, TtlSchedule, non_empty, score, time_from_score,
        ttl_secs,
    },
    chrono::{DateTime, Utc},
    model::outbox::{OutboxMessage, TerminalStatus},
    redis::{AsyncCommands as _, Pipeline, aio::ConnectionManager},
    std::{collections::HashMap, time::Duration},
};

const PENDING: &str = "outbox:pending";
const SENT: &str = "outbox:sent";

/// Base delay of the delivery backoff schedule.
const BASE_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Delivery backoff never exceeds one day.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

fn message_key(message_id: &str) -> String {
    format!("outbox:message:{message_id}")
}

fn task_key(task_id: &str) -> String {
    format!("outbox:task:{task_id}")
}

fn document_key(document_id: &str) -> String {
    format!("outbox:document:{document_id}")
}

/// Data needed to enqueue a notification.
#[derive(Clone, Debug)]
pub struct NewOutboxMessage {
    pub message_id: String,
    pub task_id: String,
    pub document_id: String,
    pub status: TerminalStatus,
    pub payload: serde_json::Value,
    pub callback_url: Option<String>,
}

/// Delay before the `retry_count + 1`-th delivery attempt:
/// `60s · 2^retry_count`, capped at 24h.
pub fn retry_delay(retry_count: u32) -> Duration {
    BASE_RETRY_DELAY
        .saturating_mul(2u32.saturating_pow(retry_count))
        .min(MAX_RETRY_DELAY)
}

#[derive(Clone)]
pub struct OutboxStore {
    conn: ConnectionManager,
    ttls: TtlSchedule,
}

impl OutboxStore {
    pub(crate) fn new(conn: ConnectionManager, ttls: TtlSchedule) -> Self {
        Self { conn, ttls }
    }

    /// Writes the message and makes it immediately due. Idempotent on
    /// `message_id`: enqueueing an existing message is a no-op returning
    /// false.
    pub async fn enqueue(&self, message: NewOutboxMessage) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(message_key(&message.message_id))
            .await
            .op("outbox_enqueue")?;
        if exists {
            return Ok(false);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_enqueue(&mut pipe, &message, Utc::now(), self.ttls);
        let _: () = pipe.query_async(&mut conn).await.op("outbox_enqueue")?;
        Ok(true)
    }

    /// Up to `limit` messages due at `now` (`next_retry_at <= now`), oldest
    /// due first. Stale queue entries whose record expired are dropped.
    pub async fn claim(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn
            .zrangebyscore_limit(PENDING, f64::NEG_INFINITY, score(now), 0, count)
            .await
            .op("outbox_claim")?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> =
                conn.hgetall(message_key(&id)).await.op("outbox_claim")?;
            if fields.is_empty() {
                tracing::debug!(message = id, "dropping stale outbox queue entry");
                let _: () = conn.zrem(PENDING, &id).await.op("outbox_claim")?;
                continue;
            }
            messages.push(parse_message(&id, fields)?);
        }
        Ok(messages)
    }

    /// Records the receiver's acknowledgement and retires the message from
    /// the pending queue. Idempotent: repeated calls keep the first
    /// `sent_at`.
    pub async fn mark_sent(&self, message_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (sent_at, task_id, document_id): (Option<String>, Option<String>, Option<String>) =
            conn.hget(
                message_key(message_id),
                &["sent_at", "task_id", "document_id"],
            )
            .await
            .op("outbox_mark_sent")?;
        if task_id.is_none() {
            // The record never existed or already expired.
            return Ok(false);
        }
        let now = Utc::now();
        let ttl = ttl_secs(self.ttls.completed);
        let mut pipe = redis::pipe();
        pipe.atomic();
        if sent_at.as_deref().unwrap_or_default().is_empty() {
            pipe.hset(message_key(message_id), "sent_at", score(now).to_string())
                .ignore();
        }
        pipe.zrem(PENDING, message_id).ignore();
        pipe.zadd(SENT, message_id, score(now)).ignore();
        pipe.expire(message_key(message_id), ttl).ignore();
        if let Some(task_id) = task_id {
            pipe.expire(task_key(&task_id), ttl).ignore();
        }
        if let Some(document_id) = document_id {
            pipe.expire(document_key(&document_id), ttl).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.op("outbox_mark_sent")?;
        Ok(true)
    }

    /// Records a failed delivery: bumps `retry_count`, stores the error and
    /// re-scores the pending entry to the next attempt time.
    pub async fn mark_failed(&self, message_id: &str, error: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (retry_count, task_id, document_id): (Option<String>, Option<String>, Option<String>) =
            conn.hget(
                message_key(message_id),
                &["retry_count", "task_id", "document_id"],
            )
            .await
            .op("outbox_mark_failed")?;
        if task_id.is_none() {
            return Ok(false);
        }
        let retry_count: u32 = retry_count
            .as_deref()
            .unwrap_or_default()
            .parse()
            .unwrap_or(0);
        let now = Utc::now();
        let next_retry_at = now + retry_delay(retry_count);
        let ttl = ttl_secs(self.ttls.failed);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            message_key(message_id),
            &[
                ("retry_count", (retry_count + 1).to_string()),
                ("next_retry_at", score(next_retry_at).to_string()),
                ("last_error", error.to_string()),
            ],
        )
        .ignore();
        pipe.zadd(PENDING, message_id, score(next_retry_at)).ignore();
        pipe.expire(message_key(message_id), ttl).ignore();
        if let Some(task_id) = task_id {
            pipe.expire(task_key(&task_id), ttl).ignore();
        }
        if let Some(document_id) = document_id {
            pipe.expire(document_key(&document_id), ttl).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.op("outbox_mark_failed")?;
        Ok(true)
    }

    /// Loads a single message, mostly useful for inspection and tests.
    pub async fn get_message(&self, message_id: &str) -> Result<Option<OutboxMessage>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(message_key(message_id))
            .await
            .op("outbox_get_message")?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_message(message_id, fields).map(Some)
    }
}

/// Queues the writes of one enqueue onto `pipe`: the record, the pending
/// queue entry scored by creation time and the task/document indices.
pub fn queue_enqueue(
    pipe: &mut Pipeline,
    message: &NewOutboxMessage,
    now: DateTime<Utc>,
    ttls: TtlSchedule,
) {
    let ttl = ttl_secs(ttls.pending);
    pipe.hset_multiple(
        message_key(&message.message_id),
        &[
            ("task_id", message.task_id.clone()),
            ("document_id", message.document_id.clone()),
            ("status", message.status.to_string()),
            ("payload", message.payload.to_string()),
            ("callback_url", message.callback_url.clone().unwrap_or_default()),
            ("created_at", score(now).to_string()),
            ("sent_at", String::new()),
            ("retry_count", "0".to_string()),
            ("next_retry_at", score(now).to_string()),
            ("last_error", String::new()),
        ],
    )
    .ignore();
    pipe.expire(message_key(&message.message_id), ttl).ignore();
    pipe.zadd(PENDING, &message.message_id, score(now)).ignore();
    pipe.sadd(task_key(&message.task_id), &message.message_id)
        .ignore();
    pipe.expire(task_key(&message.task_id), ttl).ignore();
    pipe.sadd(document_key(&message.document_id), &message.message_id)
        .ignore();
    pipe.expire(document_key(&message.document_id), ttl).ignore();
}

fn parse_message(message_id: &str, fields: HashMap<String, String>) -> Result<OutboxMessage> {
    let malformed = |reason: String| Error::Malformed {
        key: message_key(message_id),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| malformed(format!("missing field {name}")))
    };
    let status: TerminalStatus = field("status")?
        .parse()
        .map_err(|_| malformed("unknown status".to_string()))?;
    let timestamp = |name: &str| -> Result<DateTime<Utc>> {
        let raw = field(name)?;
        let score: f64 = raw
            .parse()
            .map_err(|err| malformed(format!("bad timestamp {name}: {err}")))?;
        Ok(time_from_score(score))
    };
    // Tolerate unreadable payloads instead of wedging the queue on one
    // record.
    let payload = serde_json::from_str(&field("payload")?).unwrap_or_else(|err| {
        tracing::warn!(message = message_id, ?err, "unreadable outbox payload");
        serde_json::Value::Object(Default::default())
    });
    let sent_at = match fields.get("sent_at").cloned().and_then(non_empty) {
        Some(raw) => Some(time_from_score(raw.parse().map_err(|err| {
            malformed(format!("bad timestamp sent_at: {err}"))
        })?)),
        None => None,
    };
    Ok(OutboxMessage {
        message_id: message_id.to_string(),
        task_id: field("task_id")?,
        document_id: field("document_id")?,
        status,
        payload,
        callback_url: fields.get("callback_url").cloned().and_then(non_empty),
        created_at: timestamp("created_at")?,
        sent_at,
        retry_count: field("retry_count")?
            .parse()
            .map_err(|err| malformed(format!("bad retry_count: {err}")))?,
        next_retry_at: timestamp("next_retry_at")?,
        last_error: fields.get("last_error").cloned().and_then(non_empty),
    })
}
