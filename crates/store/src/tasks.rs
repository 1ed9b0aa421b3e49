//! Task records and their state-indexed queues.
//!
//! Layout:
//! - `task:<task_id>` hash for the scalar fields.
//! - `task:<task_id>:{prompt,result,error,callback_url,callback_secret}`
//!   separate blobs, so scans over the queues never pull large payloads and
//!   every blob carries its own TTL.
//! - `tasks:<state>` sorted set per state, scored by enqueue time. A task is
//!   a member of exactly one of them.
//! - `tasks:batch:<batch_id>` / `tasks:document:<document_id>` sorted sets.

use {
    crate::{
        Error, RedisResultExt as _, Result, TtlSchedule, non_empty,
        outbox::{self, NewOutboxMessage},
        score, ttl_secs,
    },
    chrono::{DateTime, Utc},
    model::{
        outbox::TerminalStatus,
        task::{Task, TaskState},
    },
    redis::{AsyncCommands as _, Pipeline, aio::ConnectionManager},
    std::collections::HashMap,
};

fn task_key(task_id: &str) -> String {
    format!("task:{task_id}")
}

fn blob_key(task_id: &str, field: &str) -> String {
    format!("task:{task_id}:{field}")
}

fn state_key(state: TaskState) -> String {
    format!("tasks:{state}")
}

fn batch_key(batch_id: &str) -> String {
    format!("tasks:batch:{batch_id}")
}

fn document_key(document_id: &str) -> String {
    format!("tasks:document:{document_id}")
}

/// Data needed to create a task record.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub task_id: String,
    pub document_id: String,
    pub prompt: String,
    pub callback_url: String,
    pub callback_secret: String,
    /// Already known when the remote batch was created before the record.
    pub batch_id: Option<String>,
}

/// Fields merged into the record during a state transition.
#[derive(Clone, Debug, Default)]
pub struct TaskPatch {
    pub batch_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub processing_time: Option<f64>,
}

impl TaskPatch {
    pub fn batch_id(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Which attempt counter [`TaskStore::increment_attempt`] bumps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttemptKind {
    Submit,
    Callback,
}

impl AttemptKind {
    fn field(&self) -> &'static str {
        match self {
            AttemptKind::Submit => "attempts",
            AttemptKind::Callback => "callback_attempts",
        }
    }
}

#[derive(Clone)]
pub struct TaskStore {
    conn: ConnectionManager,
    ttls: TtlSchedule,
}

impl TaskStore {
    pub(crate) fn new(conn: ConnectionManager, ttls: TtlSchedule) -> Self {
        Self { conn, ttls }
    }

    /// Atomically writes the record, enqueues it as `pending` and indexes it
    /// by document (and batch, when already known).
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let ttl = ttl_secs(self.ttls.pending);
        let task_key = task_key(&new.task_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            &task_key,
            &[
                ("document_id", new.document_id.clone()),
                ("status", TaskState::Pending.to_string()),
                ("created_at", now.to_rfc3339()),
                ("updated_at", now.to_rfc3339()),
                ("attempts", "0".to_string()),
                ("callback_attempts", "0".to_string()),
                ("batch_id", new.batch_id.clone().unwrap_or_default()),
            ],
        )
        .ignore();
        pipe.expire(&task_key, ttl).ignore();
        for (field, value) in [
            ("prompt", &new.prompt),
            ("callback_url", &new.callback_url),
            ("callback_secret", &new.callback_secret),
        ] {
            let key = blob_key(&new.task_id, field);
            pipe.set(&key, value).ignore();
            pipe.expire(&key, ttl).ignore();
        }
        pipe.zadd(state_key(TaskState::Pending), &new.task_id, score(now))
            .ignore();
        pipe.zadd(document_key(&new.document_id), &new.task_id, score(now))
            .ignore();
        if let Some(batch_id) = &new.batch_id {
            pipe.zadd(batch_key(batch_id), &new.task_id, score(now))
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.op("create_task")?;
        Ok(Task {
            task_id: new.task_id,
            document_id: new.document_id,
            state: TaskState::Pending,
            prompt: Some(new.prompt),
            callback_url: Some(new.callback_url),
            callback_secret: Some(new.callback_secret),
            batch_id: new.batch_id,
            attempts: 0,
            callback_attempts: 0,
            result: None,
            error: None,
            input_tokens: None,
            output_tokens: None,
            processing_time: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Moves the task to `new_state`, merging `patch` and re-setting the TTL
    /// per the new state's schedule. Returns false when the task does not
    /// exist. The store does not validate transition legality; callers do.
    pub async fn update_state(
        &self,
        task_id: &str,
        new_state: TaskState,
        patch: TaskPatch,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let Some(prev) = self.current_state(&mut conn, task_id).await? else {
            return Ok(false);
        };
        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_update_state(
            &mut pipe,
            task_id,
            prev,
            new_state,
            &patch,
            Utc::now(),
            self.ttls,
        );
        let _: () = pipe.query_async(&mut conn).await.op("update_state")?;
        Ok(true)
    }

    /// Terminal transition paired with its outbox message in one atomic
    /// pipeline, so a reader never observes one without the other.
    pub async fn finish_task(
        &self,
        task_id: &str,
        status: TerminalStatus,
        patch: TaskPatch,
        message: NewOutboxMessage,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let Some(prev) = self.current_state(&mut conn, task_id).await? else {
            return Ok(false);
        };
        let new_state = match status {
            TerminalStatus::Completed => TaskState::Completed,
            TerminalStatus::Failed => TaskState::Failed,
        };
        let now = Utc::now();
        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_update_state(&mut pipe, task_id, prev, new_state, &patch, now, self.ttls);
        outbox::queue_enqueue(&mut pipe, &message, now, self.ttls);
        let _: () = pipe.query_async(&mut conn).await.op("finish_task")?;
        Ok(true)
    }

    pub async fn get_task(&self, task_id: &str, include_prompt: bool) -> Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(task_key(task_id)).await.op("get_task")?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut blob_keys = vec![
            blob_key(task_id, "callback_url"),
            blob_key(task_id, "callback_secret"),
            blob_key(task_id, "result"),
            blob_key(task_id, "error"),
        ];
        if include_prompt {
            blob_keys.push(blob_key(task_id, "prompt"));
        }
        let mut blobs: Vec<Option<String>> = conn.mget(&blob_keys).await.op("get_task")?;
        let prompt = if include_prompt { blobs.pop().flatten() } else { None };
        let error = blobs.pop().flatten();
        let result = blobs.pop().flatten();
        let callback_secret = blobs.pop().flatten();
        let callback_url = blobs.pop().flatten();
        parse_task(
            task_id,
            fields,
            prompt,
            callback_url,
            callback_secret,
            result,
            error,
        )
        .map(Some)
    }

    /// The `limit` oldest pending tasks by enqueue time, prompts included.
    /// Stale queue entries whose record expired are dropped from the index.
    pub async fn get_pending(&self, limit: usize) -> Result<Vec<Task>> {
        self.tasks_from_queue(&state_key(TaskState::Pending), limit, true)
            .await
    }

    /// All tasks submitted under `batch_id`, in per-batch enqueue order.
    pub async fn get_by_batch(&self, batch_id: &str, limit: usize) -> Result<Vec<Task>> {
        self.tasks_from_queue(&batch_key(batch_id), limit, false)
            .await
    }

    /// Member task ids of a state queue, oldest first.
    pub async fn list_state(&self, state: TaskState) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.zrange(state_key(state), 0, -1).await.op("list_state")
    }

    /// Atomically bumps one of the attempt counters, returning the new
    /// value, or None when the task does not exist.
    pub async fn increment_attempt(
        &self,
        task_id: &str,
        kind: AttemptKind,
    ) -> Result<Option<u32>> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(task_key(task_id))
            .await
            .op("increment_attempt")?;
        if !exists {
            return Ok(None);
        }
        let value: i64 = conn
            .hincr(task_key(task_id), kind.field(), 1)
            .await
            .op("increment_attempt")?;
        Ok(Some(u32::try_from(value).unwrap_or(u32::MAX)))
    }

    async fn current_state(
        &self,
        conn: &mut ConnectionManager,
        task_id: &str,
    ) -> Result<Option<TaskState>> {
        let status: Option<String> = conn
            .hget(task_key(task_id), "status")
            .await
            .op("current_state")?;
        status
            .map(|status| {
                status.parse().map_err(|_| Error::Malformed {
                    key: task_key(task_id),
                    reason: format!("unknown status {status:?}"),
                })
            })
            .transpose()
    }

    async fn tasks_from_queue(
        &self,
        queue: &str,
        limit: usize,
        include_prompt: bool,
    ) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrange(queue, 0, stop).await.op("tasks_from_queue")?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_task(&id, include_prompt).await? {
                Some(task) => tasks.push(task),
                None => {
                    tracing::debug!(task = id, queue, "dropping stale queue entry");
                    let _: () = conn.zrem(queue, &id).await.op("tasks_from_queue")?;
                }
            }
        }
        Ok(tasks)
    }
}

/// Queues all writes of one state transition onto `pipe`: field updates,
/// result/error blobs, queue moves and the TTL refresh.
pub fn queue_update_state(
    pipe: &mut Pipeline,
    task_id: &str,
    prev: TaskState,
    new_state: TaskState,
    patch: &TaskPatch,
    now: DateTime<Utc>,
    ttls: TtlSchedule,
) {
    let ttl = ttl_secs(ttls.for_state(new_state));
    let mut updates = vec![
        ("status", new_state.to_string()),
        ("updated_at", now.to_rfc3339()),
    ];
    if let Some(batch_id) = &patch.batch_id {
        updates.push(("batch_id", batch_id.clone()));
        pipe.zadd(batch_key(batch_id), task_id, score(now)).ignore();
        pipe.expire(batch_key(batch_id), ttl).ignore();
    }
    if let Some(input_tokens) = patch.input_tokens {
        updates.push(("input_tokens", input_tokens.to_string()));
    }
    if let Some(output_tokens) = patch.output_tokens {
        updates.push(("output_tokens", output_tokens.to_string()));
    }
    if let Some(processing_time) = patch.processing_time {
        updates.push(("processing_time", processing_time.to_string()));
    }
    if let Some(result) = &patch.result {
        let key = blob_key(task_id, "result");
        pipe.set(&key, serde_json::to_string(result).unwrap()).ignore();
        pipe.expire(&key, ttl).ignore();
    }
    if let Some(error) = &patch.error {
        let key = blob_key(task_id, "error");
        pipe.set(&key, error).ignore();
        pipe.expire(&key, ttl).ignore();
    }
    pipe.hset_multiple(task_key(task_id), &updates).ignore();
    for key in [
        task_key(task_id),
        blob_key(task_id, "prompt"),
        blob_key(task_id, "callback_url"),
        blob_key(task_id, "callback_secret"),
    ] {
        pipe.expire(key, ttl).ignore();
    }
    if prev != new_state {
        pipe.zrem(state_key(prev), task_id).ignore();
        pipe.zadd(state_key(new_state), task_id, score(now)).ignore();
    }
}

fn parse_task(
    task_id: &str,
    fields: HashMap<String, String>,
    prompt: Option<String>,
    callback_url: Option<String>,
    callback_secret: Option<String>,
    result: Option<String>,
    error: Option<String>,
) -> Result<Task> {
    let malformed = |reason: String| Error::Malformed {
        key: task_key(task_id),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| malformed(format!("missing field {name}")))
    };
    let state: TaskState = field("status")?
        .parse()
        .map_err(|_| malformed("unknown status".to_string()))?;
    let timestamp = |name: &str| {
        DateTime::parse_from_rfc3339(&field(name)?)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|err| malformed(format!("bad timestamp {name}: {err}")))
    };
    let counter = |name: &str| {
        fields
            .get(name)
            .map(|value| value.parse::<u32>())
            .transpose()
            .map_err(|err| malformed(format!("bad counter {name}: {err}")))
            .map(Option::unwrap_or_default)
    };
    let result = result
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| malformed(format!("bad result json: {err}")))
        })
        .transpose()?;
    Ok(Task {
        task_id: task_id.to_string(),
        document_id: field("document_id")?,
        state,
        prompt,
        callback_url,
        callback_secret,
        batch_id: fields.get("batch_id").cloned().and_then(non_empty),
        attempts: counter("attempts")?,
        callback_attempts: counter("callback_attempts")?,
        result,
        error,
        input_tokens: fields
            .get("input_tokens")
            .and_then(|value| value.parse().ok()),
        output_tokens: fields
            .get("output_tokens")
            .and_then(|value| value.parse().ok()),
        processing_time: fields
            .get("processing_time")
            .and_then(|value| value.parse().ok()),
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}
