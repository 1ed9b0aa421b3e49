use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Processing status of a remote batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchState {
    InProgress,
    Canceling,
    Ended,
    Expired,
    Canceled,
    /// Statuses this version does not know about. Treated like any other
    /// non-`ended` status: keep polling.
    #[serde(other)]
    Unknown,
}

impl BatchState {
    /// Only `ended` batches have results to fetch. Everything else,
    /// including `expired` and `canceled`, is re-polled.
    pub fn is_ended(&self) -> bool {
        matches!(self, BatchState::Ended)
    }
}

/// Response to a batch submission.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchCreated {
    pub batch_id: String,
    pub state: BatchState,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Full batch status as reported by the remote API.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchInfo {
    pub batch_id: String,
    pub state: BatchState,
    pub created_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub results_url: Option<String>,
    pub request_counts: RequestCounts,
}

impl BatchInfo {
    /// Wall-clock seconds the batch spent processing, when the remote API
    /// reported both timestamps.
    pub fn processing_time(&self) -> Option<f64> {
        let (created, ended) = (self.created_at?, self.ended_at?);
        Some((ended - created).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestCounts {
    pub processing: u64,
    pub succeeded: u64,
    pub errored: u64,
    pub canceled: u64,
    pub expired: u64,
}

/// One entry of a batch's result stream, keyed by the `custom_id` the
/// request was submitted under.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchResultItem {
    pub custom_id: String,
    pub result: ResultEntry,
}

/// Per-request outcome inside an ended batch.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultEntry {
    Succeeded {
        /// The first `text` content item of the response message.
        text: String,
        message_id: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    Errored {
        message: String,
    },
    /// Any other per-request outcome (`canceled`, `expired`, ...).
    Other {
        kind: String,
    },
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::TimeZone};

    #[test]
    fn processing_time_needs_both_timestamps() {
        let mut info = BatchInfo {
            batch_id: "b1".to_string(),
            state: BatchState::Ended,
            created_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()),
            ended_at: None,
            expires_at: None,
            results_url: None,
            request_counts: Default::default(),
        };
        assert_eq!(info.processing_time(), None);

        info.ended_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 1, 30).unwrap());
        assert_eq!(info.processing_time(), Some(90.0));
    }

    #[test]
    fn batch_state_decoding() {
        let state: BatchState = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(state, BatchState::InProgress);
        let state: BatchState = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(state, BatchState::Unknown);
        assert!(!state.is_ended());
        assert!(BatchState::Ended.is_ended());
        assert!(!BatchState::Expired.is_ended());
    }
}
