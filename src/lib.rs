//! # taskloop
//!
//! Postgres-backed task loop: a durable to-do list of identifiers that
//! need periodic reprocessing (reindexing, refreshing, re-crawling),
//! shared safely by any number of independent worker processes.
//!
//! Workers call [`get`] to lease a batch of ids, do the actual work
//! outside this crate, then call [`did`] (done) or [`unlock`] (gave up).
//! Producers call [`bump`] to move specific ids to the front of the
//! queue. Monitoring calls [`check`] and [`stats`]. Leases expire on
//! their own, so a crashed worker's ids come back into circulation the
//! next time anyone calls [`get`] — there is no cleanup daemon.
//!
//! The store's row and table locks are the only mutual exclusion; the
//! crate holds no in-process locks and keeps no shared mutable state.
//!
//! ## Table contract
//!
//! The loop table is provisioned by the caller, one row per id:
//!
//! ```sql
//! CREATE TABLE my_loop (
//!     id             BIGINT PRIMARY KEY,  -- or TEXT, UUID, ...
//!     last_completed TIMESTAMPTZ,         -- NULL = never processed
//!     lease_until    TIMESTAMPTZ          -- NULL = not leased
//! );
//! CREATE INDEX ON my_loop (lease_until, last_completed);
//! ```
//!
//! The composite index is what keeps the two priority scans cheap.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> taskloop::Result<()> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/app").await?;
//! let queue: taskloop::TaskLoop<i64> = taskloop::TaskLoop::new(pool, "biz_reindex_loop")?;
//!
//! queue.add(&[101, 102, 103], false, false).await?;
//!
//! let batch = queue.get(100, taskloop::ONE_HOUR, taskloop::ONE_HOUR, false).await?;
//! for id in &batch {
//!     // reindex_biz(*id) ...
//! }
//! queue.did(&batch, true, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod error;
pub mod ops;
pub mod txn;

use std::marker::PhantomData;

use sqlx::PgPool;

pub use audit::{ItemStatus, LoopStats, check, stats};
pub use error::{Error, Result, is_transient_contention};
pub use ops::{add, bump, did, get, remove, unlock};

/// One hour in seconds: the default lease duration and recycle interval.
pub const ONE_HOUR: f64 = 3600.0;
pub const ONE_DAY: f64 = 86400.0;
pub const ONE_WEEK: f64 = 86400.0 * 7.0;

/// Identifier types usable as loop ids: anything that maps to a Postgres
/// column type (`i64`, `String`, `uuid::Uuid` with the right feature, ...)
/// and supports the map/set plumbing the protocol needs.
pub trait Key:
    for<'r> sqlx::Decode<'r, sqlx::Postgres>
    + for<'q> sqlx::Encode<'q, sqlx::Postgres>
    + sqlx::Type<sqlx::Postgres>
    + Clone
    + Eq
    + std::hash::Hash
    + Send
    + Sync
    + Unpin
{
}

impl<T> Key for T where
    T: for<'r> sqlx::Decode<'r, sqlx::Postgres>
        + for<'q> sqlx::Encode<'q, sqlx::Postgres>
        + sqlx::Type<sqlx::Postgres>
        + Clone
        + Eq
        + std::hash::Hash
        + Send
        + Sync
        + Unpin
{
}

/// Handle for one task loop: a connection pool plus a table name.
///
/// Plain configuration — every operation is a free function taking this
/// by reference, and the inherent methods below just delegate. Clone it
/// freely; the pool is internally shared.
#[derive(Clone)]
pub struct TaskLoop<I> {
    pool: PgPool,
    table: String,
    max_attempts: Option<u32>,
    _id: PhantomData<fn() -> I>,
}

impl<I: Key> TaskLoop<I> {
    /// Bind a pool to a loop table. The table name is validated here,
    /// once, so the SQL the operations assemble can embed it safely.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool,
            table,
            max_attempts: None,
            _id: PhantomData,
        })
    }

    /// Cap contention retries for operations issued through this handle.
    /// Default is unbounded, which is safe because every unit of work is
    /// idempotent; cap it if you want a hard bound on worst-case latency.
    /// Exceeding the cap surfaces as [`Error::RetriesExhausted`].
    pub fn max_attempts(mut self, cap: u32) -> Self {
        self.max_attempts = Some(cap);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn add(&self, ids: &[I], mark_completed: bool, dry_run: bool) -> Result<u64> {
        ops::add(self, ids, mark_completed, dry_run).await
    }

    pub async fn get(
        &self,
        limit: u64,
        lease_for: f64,
        min_recycle: f64,
        dry_run: bool,
    ) -> Result<Vec<I>> {
        ops::get(self, limit, lease_for, min_recycle, dry_run).await
    }

    pub async fn did(&self, ids: &[I], auto_add: bool, dry_run: bool) -> Result<u64> {
        ops::did(self, ids, auto_add, dry_run).await
    }

    pub async fn unlock(&self, ids: &[I], auto_add: bool, dry_run: bool) -> Result<u64> {
        ops::unlock(self, ids, auto_add, dry_run).await
    }

    pub async fn bump(
        &self,
        ids: &[I],
        lease_for: f64,
        auto_add: bool,
        dry_run: bool,
    ) -> Result<u64> {
        ops::bump(self, ids, lease_for, auto_add, dry_run).await
    }

    pub async fn remove(&self, ids: &[I], dry_run: bool) -> Result<u64> {
        ops::remove(self, ids, dry_run).await
    }

    pub async fn check(&self, ids: &[I]) -> Result<std::collections::HashMap<I, ItemStatus>> {
        audit::check(self, ids).await
    }

    pub async fn stats(&self) -> Result<LoopStats<I>> {
        audit::stats(self, &[]).await
    }

    /// Like [`stats`](Self::stats), with a staleness histogram: for each
    /// threshold, the count of unleased ids at least that overdue.
    pub async fn stats_with_thresholds(&self, thresholds: &[f64]) -> Result<LoopStats<I>> {
        audit::stats(self, thresholds).await
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Table name as a quoted identifier, ready to splice into SQL.
    pub(crate) fn quoted_table(&self) -> String {
        format!("\"{}\"", self.table)
    }

    pub(crate) fn retry_cap(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl<I> std::fmt::Debug for TaskLoop<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLoop")
            .field("table", &self.table)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Table names are spliced into SQL as identifiers (they cannot be bound
/// as parameters), so only plain unquoted-identifier shapes are accepted.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && table.len() <= 63
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "not a valid table name: {table:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert!(validate_table_name("foo_loop").is_ok());
        assert!(validate_table_name("_loop2").is_ok());
        assert!(validate_table_name("L").is_ok());

        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2fast").is_err());
        assert!(validate_table_name("foo loop").is_err());
        assert!(validate_table_name("foo\"; DROP TABLE x; --").is_err());
        assert!(validate_table_name(&"x".repeat(64)).is_err());
    }

    // pool construction spawns maintenance tasks, so this needs a runtime
    // even though connect_lazy never dials out
    #[tokio::test]
    async fn bad_table_name_rejected_at_construction() {
        let pool = PgPool::connect_lazy("postgres://localhost/unreachable").unwrap();
        let err = TaskLoop::<i64>::new(pool, "no spaces allowed").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
