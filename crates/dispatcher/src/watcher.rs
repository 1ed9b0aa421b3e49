//! The batch watcher: polls in-flight batches and, once a batch ends,
//! demultiplexes its result stream into terminal task transitions plus
//! outbox notifications.

use {
    anyhow::{Context as _, Result},
    batch_api::BatchApi,
    model::{
        batch::ResultEntry,
        outbox::TerminalStatus,
        task::{Task, TaskState},
    },
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::Duration,
    },
    store::{
        outbox::NewOutboxMessage,
        tasks::{TaskPatch, TaskStore},
    },
    tokio::sync::watch,
};

/// Upper bound on tasks loaded per batch; a batch holds the requests of one
/// dispatch fan-out, so this is generous.
const BATCH_TASKS_LIMIT: usize = 1_000;

/// Error recorded on the losers of a duplicate `document_id` within one
/// batch; the single result entry binds to the first task in per-batch
/// order.
pub const DUPLICATE_DOCUMENT_ERROR: &str = "duplicate document id in batch";

pub struct BatchWatcher {
    tasks: TaskStore,
    api: Arc<dyn BatchApi>,
    check_interval: Duration,
}

impl BatchWatcher {
    pub fn new(tasks: TaskStore, api: Arc<dyn BatchApi>, check_interval: Duration) -> Self {
        Self {
            tasks,
            api,
            check_interval,
        }
    }

    pub async fn run_forever(self, mut stop: watch::Receiver<bool>) {
        while !*stop.borrow() {
            let delay = match self.single_cycle().await {
                Ok(()) => self.check_interval,
                Err(err) => {
                    tracing::error!(?err, "batch check cycle failed");
                    self.check_interval * 2
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = stop.changed() => (),
            }
        }
        tracing::info!("batch watcher stopped");
    }

    /// Polls every distinct in-flight batch once. Batch-level errors only
    /// skip that batch until the next cycle.
    pub async fn single_cycle(&self) -> Result<()> {
        let task_ids = self
            .tasks
            .list_state(TaskState::InFlight)
            .await
            .context("list in-flight tasks")?;
        let mut batches = Vec::new();
        let mut seen = HashSet::new();
        for task_id in task_ids {
            let task = self
                .tasks
                .get_task(&task_id, false)
                .await
                .context("load in-flight task")?;
            let Some(task) = task else { continue };
            let Some(batch_id) = task.batch_id else {
                tracing::warn!(task = task_id, "in-flight task without batch id");
                continue;
            };
            if seen.insert(batch_id.clone()) {
                batches.push(batch_id);
            }
        }
        for batch_id in batches {
            if let Err(err) = self.check_batch(&batch_id).await {
                tracing::error!(?err, batch = batch_id, "failed to check batch");
            }
        }
        Ok(())
    }

    async fn check_batch(&self, batch_id: &str) -> Result<()> {
        let info = self.api.batch_status(batch_id).await?;
        Metrics::get().batches_polled.inc();
        if !info.state.is_ended() {
            tracing::debug!(batch = batch_id, status = %info.state, "batch still processing");
            return Ok(());
        }

        let mut tasks = self
            .tasks
            .get_by_batch(batch_id, BATCH_TASKS_LIMIT)
            .await
            .context("load batch tasks")?;
        // A crash after finishing part of a batch leaves the rest in flight;
        // the finished ones must not re-transition.
        tasks.retain(|task| !task.state.is_terminal());
        if tasks.is_empty() {
            return Ok(());
        }

        // Single pass over the result stream; afterwards only the index is
        // consulted. The first entry per custom id wins.
        let mut results = HashMap::new();
        for item in self.api.batch_results(batch_id).await? {
            results.entry(item.custom_id).or_insert(item.result);
        }

        let outcomes = plan_outcomes(&tasks, &results, batch_id, info.processing_time());
        for (task, outcome) in tasks.iter().zip(outcomes) {
            if let Err(err) = self.apply(task, &outcome).await {
                tracing::error!(?err, task = task.task_id, "failed to finish task");
                continue;
            }
            let status = match outcome {
                Outcome::Completed { .. } => "completed",
                Outcome::Failed { .. } => "failed",
            };
            Metrics::get().tasks_finished.with_label_values(&[status]).inc();
        }
        tracing::info!(batch = batch_id, tasks = tasks.len(), "batch processed");
        Ok(())
    }

    /// Terminal transition plus outbox notification, atomically.
    async fn apply(&self, task: &Task, outcome: &Outcome) -> Result<()> {
        let (status, patch, payload) = match outcome {
            Outcome::Completed {
                text,
                input_tokens,
                output_tokens,
                processing_time,
            } => {
                let mut payload = serde_json::json!({
                    "result": text,
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                });
                if let Some(seconds) = processing_time {
                    payload["processing_time"] = serde_json::json!(seconds);
                }
                let patch = TaskPatch {
                    result: Some(serde_json::Value::String(text.clone())),
                    input_tokens: Some(*input_tokens),
                    output_tokens: Some(*output_tokens),
                    processing_time: *processing_time,
                    ..Default::default()
                };
                (TerminalStatus::Completed, patch, payload)
            }
            Outcome::Failed { error } => (
                TerminalStatus::Failed,
                TaskPatch::error(error),
                serde_json::json!({ "error": error }),
            ),
        };
        let finished = self
            .tasks
            .finish_task(
                &task.task_id,
                status,
                patch,
                NewOutboxMessage {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    task_id: task.task_id.clone(),
                    document_id: task.document_id.clone(),
                    status,
                    payload,
                    callback_url: task.callback_url.clone(),
                },
            )
            .await
            .context("finish task")?;
        if !finished {
            tracing::warn!(task = task.task_id, "task disappeared before finishing it");
        }
        Ok(())
    }
}

/// What a batch's end means for one of its tasks.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Completed {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
        processing_time: Option<f64>,
    },
    Failed {
        error: String,
    },
}

/// Plans the outcome of every task of an ended batch, in task order:
/// - a succeeded result entry completes the task,
/// - an errored entry fails it with the remote error,
/// - an absent entry fails it ("result ... not found"),
/// - a `document_id` already bound to an earlier task of the batch fails it
///   as a duplicate.
pub fn plan_outcomes(
    tasks: &[Task],
    results: &HashMap<String, ResultEntry>,
    batch_id: &str,
    processing_time: Option<f64>,
) -> Vec<Outcome> {
    let mut bound = HashSet::new();
    tasks
        .iter()
        .map(|task| {
            if !bound.insert(task.document_id.as_str()) {
                return Outcome::Failed {
                    error: DUPLICATE_DOCUMENT_ERROR.to_string(),
                };
            }
            match results.get(&task.document_id) {
                Some(ResultEntry::Succeeded {
                    text,
                    input_tokens,
                    output_tokens,
                    ..
                }) => Outcome::Completed {
                    text: text.clone(),
                    input_tokens: *input_tokens,
                    output_tokens: *output_tokens,
                    processing_time,
                },
                Some(ResultEntry::Errored { message }) => Outcome::Failed {
                    error: message.clone(),
                },
                Some(ResultEntry::Other { kind }) => Outcome::Failed {
                    error: format!("request ended as {kind} in batch {batch_id}"),
                },
                None => Outcome::Failed {
                    error: format!(
                        "result for document {} not found in batch {batch_id}",
                        task.document_id
                    ),
                },
            }
        })
        .collect()
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Batch status polls.
    batches_polled: prometheus::IntCounter,

    /// Tasks driven to a terminal state, by status.
    #[metric(labels("status"))]
    tasks_finished: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, chrono::Utc, maplit::hashmap};

    fn task(task_id: &str, document_id: &str) -> Task {
        Task {
            task_id: task_id.to_string(),
            document_id: document_id.to_string(),
            state: TaskState::InFlight,
            prompt: None,
            callback_url: None,
            callback_secret: None,
            batch_id: Some("b2".to_string()),
            attempts: 1,
            callback_attempts: 0,
            result: None,
            error: None,
            input_tokens: None,
            output_tokens: None,
            processing_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn succeeded(text: &str) -> ResultEntry {
        ResultEntry::Succeeded {
            text: text.to_string(),
            message_id: "msg_1".to_string(),
            input_tokens: 420,
            output_tokens: 18,
        }
    }

    #[test]
    fn succeeded_entries_complete_their_task() {
        let tasks = vec![task("t1", "d1")];
        let results = hashmap! { "d1".to_string() => succeeded("26.30.11.150-00000123") };
        let outcomes = plan_outcomes(&tasks, &results, "b1", Some(90.0));
        assert_eq!(
            outcomes,
            vec![Outcome::Completed {
                text: "26.30.11.150-00000123".to_string(),
                input_tokens: 420,
                output_tokens: 18,
                processing_time: Some(90.0),
            }]
        );
    }

    #[test]
    fn missing_results_fail_only_their_task() {
        let tasks = vec![task("t1", "d1"), task("t2", "d2")];
        let results = hashmap! { "d1".to_string() => succeeded("ok") };
        let outcomes = plan_outcomes(&tasks, &results, "b2", None);
        assert!(matches!(outcomes[0], Outcome::Completed { .. }));
        assert_eq!(
            outcomes[1],
            Outcome::Failed {
                error: "result for document d2 not found in batch b2".to_string(),
            }
        );
    }

    #[test]
    fn errored_entries_fail_with_the_remote_error() {
        let tasks = vec![task("t1", "d1")];
        let results = hashmap! {
            "d1".to_string() => ResultEntry::Errored { message: "bad model".to_string() },
        };
        assert_eq!(
            plan_outcomes(&tasks, &results, "b1", None),
            vec![Outcome::Failed {
                error: "bad model".to_string(),
            }]
        );
    }

    #[test]
    fn other_entries_fail_with_their_kind() {
        let tasks = vec![task("t1", "d1")];
        let results = hashmap! {
            "d1".to_string() => ResultEntry::Other { kind: "expired".to_string() },
        };
        assert_eq!(
            plan_outcomes(&tasks, &results, "b1", None),
            vec![Outcome::Failed {
                error: "request ended as expired in batch b1".to_string(),
            }]
        );
    }

    #[test]
    fn first_task_binds_a_duplicated_document() {
        let tasks = vec![task("t1", "d1"), task("t2", "d1"), task("t3", "d1")];
        let results = hashmap! { "d1".to_string() => succeeded("ok") };
        let outcomes = plan_outcomes(&tasks, &results, "b1", None);
        assert!(matches!(outcomes[0], Outcome::Completed { .. }));
        assert_eq!(
            outcomes[1],
            Outcome::Failed {
                error: DUPLICATE_DOCUMENT_ERROR.to_string(),
            }
        );
        assert_eq!(outcomes[1], outcomes[2]);
    }

    #[test]
    fn unknown_result_entries_are_ignored() {
        let tasks = vec![task("t1", "d1")];
        let results = hashmap! {
            "d1".to_string() => succeeded("ok"),
            "stranger".to_string() => succeeded("who asked"),
        };
        let outcomes = plan_outcomes(&tasks, &results, "b1", None);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Outcome::Completed { .. }));
    }
}
