use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Lifecycle state of a classification task.
///
/// A task moves `pending → processing → in_flight → {completed, failed}`,
/// with `processing → pending` on retryable submit failures. `completed` and
/// `failed` are terminal.
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
pub enum TaskState {
    /// Waiting to be picked up by the dispatch loop.
    Pending,
    /// Claimed by the dispatch loop, submission to the remote API underway.
    Processing,
    /// Submitted; waiting for the remote batch to end.
    InFlight,
    Completed,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Processing,
        TaskState::InFlight,
        TaskState::Completed,
        TaskState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// One unit of classification work.
///
/// `prompt`, `result`, `error` and the callback coordinates live in separate
/// store records; depending on how the task was loaded some of them may be
/// absent even though they are set in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub document_id: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Never serialized; it must not leave the service.
    #[serde(skip)]
    pub callback_secret: Option<String>,
    pub batch_id: Option<String>,
    pub attempts: u32,
    pub callback_attempts: u32,
    /// Opaque, caller-defined result value. Set exactly when the task
    /// completed.
    pub result: Option<serde_json::Value>,
    /// Set exactly when the task failed.
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use {super::*, std::str::FromStr};

    #[test]
    fn state_round_trips_through_strings() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_str(&state.to_string()).unwrap(), state);
        }
        assert_eq!(TaskState::InFlight.to_string(), "in_flight");
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Processing.is_terminal());
        assert!(!TaskState::InFlight.is_terminal());
    }
}
