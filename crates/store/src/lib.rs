//! Redis-backed persistence for tasks, outbound notifications and product
//! batches.
//!
//! Design:
//!
//! Every mutation that belongs to one logical transition is grouped into a
//! single atomic `MULTI`/`EXEC` pipeline so concurrent readers observe the
//! transition in full or not at all. To make that composable, the modules
//! expose `queue_*` functions that only append commands to a caller-supplied
//! [`redis::Pipeline`]; the public async methods build a pipeline, queue
//! their own commands and execute it. Operations that span modules (a
//! terminal task transition paired with its outbox message) queue into the
//! same pipeline, see [`tasks::TaskStore::finish_task`].
//!
//! Reads that feed a mutation (previous state, retry counters) happen before
//! the pipeline is built. The service runs a single writer per record, so
//! this read-then-pipeline scheme needs no optimistic locking.

pub mod outbox;
pub mod product_batches;
pub mod tasks;

use {
    chrono::{DateTime, Utc},
    model::task::TaskState,
    redis::aio::ConnectionManager,
    std::time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store operation {op} failed: {source}")]
    Redis {
        op: &'static str,
        #[source]
        source: redis::RedisError,
    },
    #[error("malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the failing operation's name to redis errors.
pub(crate) trait RedisResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> RedisResultExt<T> for std::result::Result<T, redis::RedisError> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Redis { op, source })
    }
}

/// Time-to-live applied to records on every transition, depending on the
/// state the record transitions into.
#[derive(Clone, Copy, Debug)]
pub struct TtlSchedule {
    /// Applied to all non-terminal states.
    pub pending: Duration,
    pub completed: Duration,
    pub failed: Duration,
}

impl Default for TtlSchedule {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(7 * 24 * 60 * 60),
            completed: Duration::from_secs(3 * 24 * 60 * 60),
            failed: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

impl TtlSchedule {
    pub fn for_state(&self, state: TaskState) -> Duration {
        match state {
            TaskState::Pending | TaskState::Processing | TaskState::InFlight => self.pending,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
        }
    }
}

/// Seconds for `EXPIRE`, saturating instead of wrapping for absurd inputs.
pub(crate) fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Sorted-set score for a point in time: unix seconds with millisecond
/// precision. Ties are broken by Redis itself, which orders equal scores
/// lexicographically by member.
pub(crate) fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub(crate) fn time_from_score(score: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis((score * 1000.0).round() as i64).unwrap_or_default()
}

/// Empty strings stand in for absent values in hashes, since Redis hashes
/// cannot store nulls.
pub(crate) fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Entry point owning the connection; hands out per-concern stores sharing
/// it.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
    ttls: TtlSchedule,
}

impl Store {
    pub async fn connect(url: &str, ttls: TtlSchedule) -> Result<Self> {
        let client = redis::Client::open(url).op("connect")?;
        let conn = client.get_connection_manager().await.op("connect")?;
        Ok(Self { conn, ttls })
    }

    pub fn tasks(&self) -> tasks::TaskStore {
        tasks::TaskStore::new(self.conn.clone(), self.ttls)
    }

    pub fn outbox(&self) -> outbox::OutboxStore {
        outbox::OutboxStore::new(self.conn.clone(), self.ttls)
    }

    pub fn product_batches(&self) -> product_batches::ProductBatchStore {
        product_batches::ProductBatchStore::new(self.conn.clone(), self.ttls)
    }

    /// Delete all data in the connected database. Only used by tests.
    #[allow(non_snake_case)]
    pub async fn clear_DANGER(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .op("clear")?;
        Ok(())
    }
}
