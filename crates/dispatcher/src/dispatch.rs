//! The submit loop: claims pending tasks and fans them out to the remote
//! batch API through a bounded worker pool.

use {
    anyhow::{Context as _, Result},
    batch_api::BatchApi,
    futures::StreamExt as _,
    model::{outbox::TerminalStatus, task::Task, task::TaskState},
    std::{num::NonZeroUsize, sync::Arc, time::Duration},
    store::{
        outbox::NewOutboxMessage,
        tasks::{AttemptKind, TaskPatch, TaskStore},
    },
    tokio::sync::watch,
};

/// Error recorded on tasks that ran out of submit attempts.
pub const MAX_ATTEMPTS_ERROR: &str = "maximum attempts exceeded";

/// Claims up to `batch_size` pending tasks per cycle and submits each as a
/// single-request remote batch.
///
/// Claiming does not mark tasks in the store, so exactly one dispatcher
/// process may run against a store; a second one would submit the same tasks
/// again.
pub struct Dispatcher {
    tasks: TaskStore,
    api: Arc<dyn BatchApi>,
    max_attempts: u32,
    batch_size: usize,
    concurrency: NonZeroUsize,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        tasks: TaskStore,
        api: Arc<dyn BatchApi>,
        max_attempts: u32,
        batch_size: usize,
        concurrency: NonZeroUsize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tasks,
            api,
            max_attempts,
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
                    tracing::error!(?err, "dispatch cycle failed");
                    self.poll_interval * 2
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = stop.changed() => (),
            }
        }
        tracing::info!("dispatch loop stopped");
    }

    /// One claim-and-submit round, extracted from the infinite loop for
    /// tests.
    pub async fn single_cycle(&self) -> Result<()> {
        let pending = self
            .tasks
            .get_pending(self.batch_size)
            .await
            .context("get pending tasks")?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = pending.len(), "dispatching pending tasks");
        futures::stream::iter(pending)
            .for_each_concurrent(self.concurrency.get(), |task| async move {
                let task_id = task.task_id.clone();
                if let Err(err) = self.process_task(task).await {
                    tracing::error!(?err, task = task_id, "failed to dispatch task");
                }
            })
            .await;
        Ok(())
    }

    async fn process_task(&self, task: Task) -> Result<()> {
        if task.attempts >= self.max_attempts {
            tracing::warn!(
                task = task.task_id,
                attempts = task.attempts,
                "task exceeded its attempt budget"
            );
            self.fail(&task, MAX_ATTEMPTS_ERROR).await?;
            Metrics::get().submissions.with_label_values(&["exhausted"]).inc();
            return Ok(());
        }
        let attempts = self
            .tasks
            .increment_attempt(&task.task_id, AttemptKind::Submit)
            .await
            .context("increment attempt")?;
        let Some(attempts) = attempts else {
            // Expired between the claim and now; nothing left to update.
            tracing::warn!(task = task.task_id, "task disappeared before dispatch");
            return Ok(());
        };
        self.tasks
            .update_state(&task.task_id, TaskState::Processing, TaskPatch::default())
            .await
            .context("move task to processing")?;

        let prompt = task.prompt.clone().unwrap_or_default();
        match self.api.create_batch(&task.document_id, &prompt).await {
            Ok(created) => {
                tracing::info!(
                    task = task.task_id,
                    batch = created.batch_id,
                    attempts,
                    "submitted task"
                );
                self.tasks
                    .update_state(
                        &task.task_id,
                        TaskState::InFlight,
                        TaskPatch::batch_id(&created.batch_id),
                    )
                    .await
                    .context("move task to in_flight")?;
                Metrics::get().submissions.with_label_values(&["submitted"]).inc();
            }
            Err(err) => match failure_disposition(err.retryable, attempts, self.max_attempts) {
                FailureDisposition::Retry => {
                    tracing::warn!(task = task.task_id, %err, attempts, "submit failed, retrying");
                    self.tasks
                        .update_state(&task.task_id, TaskState::Pending, TaskPatch::default())
                        .await
                        .context("requeue task")?;
                    Metrics::get().submissions.with_label_values(&["retried"]).inc();
                }
                FailureDisposition::Fail => {
                    tracing::warn!(task = task.task_id, %err, attempts, "submit failed for good");
                    self.fail(&task, &err.to_string()).await?;
                    Metrics::get().submissions.with_label_values(&["failed"]).inc();
                }
            },
        }
        Ok(())
    }

    /// Terminal failure: state transition and outbox notification in one
    /// atomic store operation.
    async fn fail(&self, task: &Task, error: &str) -> Result<()> {
        let finished = self
            .tasks
            .finish_task(
                &task.task_id,
                TerminalStatus::Failed,
                TaskPatch::error(error),
                NewOutboxMessage {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    task_id: task.task_id.clone(),
                    document_id: task.document_id.clone(),
                    status: TerminalStatus::Failed,
                    payload: serde_json::json!({ "error": error }),
                    callback_url: task.callback_url.clone(),
                },
            )
            .await
            .context("fail task")?;
        if !finished {
            tracing::warn!(task = task.task_id, "task disappeared before failing it");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureDisposition {
    /// Back to `pending` for another submit attempt.
    Retry,
    /// Terminal failure plus a `failed` outbox notification.
    Fail,
}

/// A failed submit is retried while the error is transient and the attempt
/// budget is not exhausted.
pub fn failure_disposition(
    retryable: bool,
    attempts: u32,
    max_attempts: u32,
) -> FailureDisposition {
    if retryable && attempts < max_attempts {
        FailureDisposition::Retry
    } else {
        FailureDisposition::Fail
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Submit attempts by outcome.
    #[metric(labels("outcome"))]
    submissions: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_retry_within_budget() {
        assert_eq!(failure_disposition(true, 1, 3), FailureDisposition::Retry);
        assert_eq!(failure_disposition(true, 2, 3), FailureDisposition::Retry);
    }

    #[test]
    fn exhausted_budget_fails_even_transient_errors() {
        assert_eq!(failure_disposition(true, 3, 3), FailureDisposition::Fail);
        assert_eq!(failure_disposition(true, 4, 3), FailureDisposition::Fail);
    }

    #[test]
    fn permanent_errors_fail_immediately() {
        assert_eq!(failure_disposition(false, 1, 3), FailureDisposition::Fail);
    }
}
