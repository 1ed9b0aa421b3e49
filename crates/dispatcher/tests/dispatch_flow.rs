//! Dispatch loop tests against a locally running Redis, with the remote API
//! mocked. Each test owns one Redis database and wipes it first.

use {
    batch_api::MockBatchApi,
    dispatcher::dispatch::{Dispatcher, MAX_ATTEMPTS_ERROR},
    model::{
        batch::{BatchCreated, BatchState},
        outbox::TerminalStatus,
        task::TaskState,
    },
    std::{num::NonZeroUsize, sync::Arc, time::Duration},
    store::{Store, TtlSchedule, tasks::NewTask},
};

async fn store(db: u32) -> Store {
    let store = Store::connect(
        &format!("redis://localhost:6379/{db}"),
        TtlSchedule::default(),
    )
    .await
    .unwrap();
    store.clear_DANGER().await.unwrap();
    store
}

fn new_task(task_id: &str, document_id: &str) -> NewTask {
    NewTask {
        task_id: task_id.to_string(),
        document_id: document_id.to_string(),
        prompt: "classify X".to_string(),
        callback_url: "http://localhost:9999/callback".to_string(),
        callback_secret: "s3cret".to_string(),
        batch_id: None,
    }
}

fn dispatcher(store: &Store, api: MockBatchApi) -> Dispatcher {
    Dispatcher::new(
        store.tasks(),
        Arc::new(api),
        3,
        10,
        NonZeroUsize::new(4).unwrap(),
        Duration::from_secs(5),
    )
}

fn batch(batch_id: &str) -> BatchCreated {
    BatchCreated {
        batch_id: batch_id.to_string(),
        state: BatchState::InProgress,
        created_at: None,
        expires_at: None,
    }
}

#[tokio::test]
#[ignore]
async fn retryable_failures_requeue_until_success() {
    let store = store(10).await;
    let tasks = store.tasks();
    tasks.create_task(new_task("t1", "d1")).await.unwrap();

    let mut api = MockBatchApi::new();
    api.expect_create_batch()
        .times(2)
        .returning(|_, _| Err(batch_api::Error::classified("rate limit exceeded (429)")));
    api.expect_create_batch()
        .times(1)
        .returning(|_, _| Ok(batch("b1")));
    let dispatcher = dispatcher(&store, api);

    // Two failed attempts land the task back in pending.
    for attempt in 1..=2 {
        dispatcher.single_cycle().await.unwrap();
        let task = tasks.get_task("t1", false).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, attempt);
    }

    // Third attempt sticks.
    dispatcher.single_cycle().await.unwrap();
    let task = tasks.get_task("t1", false).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::InFlight);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.batch_id.as_deref(), Some("b1"));

    // No notifications for retries.
    let claimed = store.outbox().claim(100, chrono::Utc::now()).await.unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
#[ignore]
async fn permanent_failures_fail_immediately() {
    let store = store(11).await;
    let tasks = store.tasks();
    tasks.create_task(new_task("t1", "d1")).await.unwrap();

    let mut api = MockBatchApi::new();
    api.expect_create_batch()
        .times(1)
        .returning(|_, _| Err(batch_api::Error::classified("invalid_request_error: bad model")));
    let dispatcher = dispatcher(&store, api);

    dispatcher.single_cycle().await.unwrap();

    let task = tasks.get_task("t1", false).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 1);
    assert!(task.error.unwrap().contains("invalid_request_error"));

    let claimed = store.outbox().claim(100, chrono::Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, TerminalStatus::Failed);
    assert_eq!(claimed[0].task_id, "t1");
    assert_eq!(claimed[0].document_id, "d1");
}

#[tokio::test]
#[ignore]
async fn transient_failures_fail_with_the_last_error_once_out_of_budget() {
    let store = store(12).await;
    let tasks = store.tasks();
    tasks.create_task(new_task("t1", "d1")).await.unwrap();

    let mut api = MockBatchApi::new();
    api.expect_create_batch()
        .times(3)
        .returning(|_, _| Err(batch_api::Error::classified("connection reset by peer")));
    let dispatcher = dispatcher(&store, api);

    // The third attempt is the last one; its error becomes terminal.
    for _ in 0..3 {
        dispatcher.single_cycle().await.unwrap();
    }

    let task = tasks.get_task("t1", false).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.error.unwrap().contains("connection reset by peer"));

    // Another cycle finds nothing pending and calls nothing.
    dispatcher.single_cycle().await.unwrap();

    let claimed = store.outbox().claim(100, chrono::Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, TerminalStatus::Failed);
}

#[tokio::test]
#[ignore]
async fn tasks_claimed_over_budget_fail_without_submitting() {
    let store = store(13).await;
    let tasks = store.tasks();
    tasks.create_task(new_task("t1", "d1")).await.unwrap();
    // A crash between bumping the counter and the terminal write leaves a
    // pending task that already used up its budget.
    for _ in 0..3 {
        tasks
            .increment_attempt("t1", store::tasks::AttemptKind::Submit)
            .await
            .unwrap();
    }

    // No create_batch expectation: the remote API must not be called.
    let dispatcher = dispatcher(&store, MockBatchApi::new());
    dispatcher.single_cycle().await.unwrap();

    let task = tasks.get_task("t1", false).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error.as_deref(), Some(MAX_ATTEMPTS_ERROR));

    let claimed = store.outbox().claim(100, chrono::Utc::now()).await.unwrap();
    assert_eq!(
        claimed[0].payload,
        serde_json::json!({ "error": MAX_ATTEMPTS_ERROR })
    );
}
