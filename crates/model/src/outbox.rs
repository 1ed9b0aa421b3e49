use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// The terminal task state a notification reports. Mirrors
/// [`crate::task::TaskState::Completed`] / `Failed`.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

/// A durable outbound notification, written atomically with the terminal
/// task transition that produced it and delivered by the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub message_id: String,
    pub task_id: String,
    pub document_id: String,
    pub status: TerminalStatus,
    /// Serialized notification payload: `{result, processing_time?,
    /// input_tokens?, output_tokens?}` for completed tasks, `{error}` for
    /// failed ones.
    pub payload: serde_json::Value,
    /// Captured from the task at enqueue time. The relay falls back to its
    /// configured callback URL when empty.
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the receiver acknowledged the message; such messages are
    /// never retried.
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
