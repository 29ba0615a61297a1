//! Transaction runner: isolation level, optional collection lock, and
//! retry on transient contention.
//!
//! Every protocol operation is one short-lived transaction. Deadlocks and
//! lock-wait timeouts are expected when many workers race for the same
//! priority tier; they roll back cleanly and the whole unit of work is
//! re-run from a fresh transaction, so the caller never sees them.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Error, Result};

/// Transaction isolation levels, in increasing strictness.
///
/// Postgres accepts `READ UNCOMMITTED` but runs it as `READ COMMITTED`;
/// we still request it where dirty reads would be acceptable, to document
/// intent and to get the weakest level the store offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn as_sql(self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }
}

/// Policy for one unit of work.
#[derive(Debug, Clone, Copy)]
pub struct TxnOptions<'a> {
    pub isolation: Isolation,

    /// Take an `EXCLUSIVE` lock on this table before the unit of work,
    /// serializing against every other writer of the collection. Used
    /// only where an ordered range scan + update cannot be protected by
    /// per-row locks alone. Released at commit/rollback either way.
    pub lock_table: Option<&'a str>,

    /// Roll back instead of committing, regardless of outcome. Return
    /// values are still produced; visible state never advances. Used for
    /// audit reads and dry-run mode.
    pub read_only: bool,

    /// Re-run the unit of work from a fresh transaction on deadlock or
    /// lock-wait timeout. Safe because units of work are idempotent and
    /// side-effect-free outside the transaction.
    pub retry_on_contention: bool,

    /// Cap on total attempts; `None` retries without bound.
    pub max_attempts: Option<u32>,
}

impl<'a> TxnOptions<'a> {
    /// Policy for the ordinary mutating operations: READ COMMITTED,
    /// no collection lock, retry on contention.
    pub fn mutation(dry_run: bool, max_attempts: Option<u32>) -> Self {
        Self {
            isolation: Isolation::ReadCommitted,
            lock_table: None,
            read_only: dry_run,
            retry_on_contention: true,
            max_attempts,
        }
    }

    /// Policy for audit reads: read-only, no locks, no retry.
    pub fn read(isolation: Isolation) -> Self {
        Self {
            isolation,
            lock_table: None,
            read_only: true,
            retry_on_contention: false,
            max_attempts: None,
        }
    }
}

/// Drives one unit of work to completion under a [`TxnOptions`] policy.
///
/// Callers loop: `begin` a transaction, run their queries on it, `finish`
/// it; on error, `recover` decides between retrying and propagating. A
/// transaction dropped without `finish` (the error path) rolls back on
/// drop, so no partial state survives a failed attempt.
pub struct Runner<'a> {
    pool: &'a PgPool,
    opts: TxnOptions<'a>,
    attempts: u32,
}

impl<'a> Runner<'a> {
    pub fn new(pool: &'a PgPool, opts: TxnOptions<'a>) -> Self {
        Self {
            pool,
            opts,
            attempts: 0,
        }
    }

    /// Open a transaction per the policy: fresh pool connection (any
    /// abandoned transaction state was reset at check-in), requested
    /// isolation level, then the collection lock if one is called for.
    pub async fn begin(&mut self) -> Result<Transaction<'static, Postgres>> {
        self.attempts += 1;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            self.opts.isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;
        if let Some(table) = self.opts.lock_table {
            sqlx::query(&format!("LOCK TABLE \"{table}\" IN EXCLUSIVE MODE"))
                .execute(&mut *tx)
                .await?;
        }
        Ok(tx)
    }

    /// Commit (or roll back, when the policy is read-only) and hand the
    /// unit of work's value back to the caller.
    pub async fn finish<T>(&self, tx: Transaction<'static, Postgres>, value: T) -> Result<T> {
        if self.opts.read_only {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(value)
    }

    /// Decide what to do with a failed attempt: swallow the error and let
    /// the caller loop again, or hand it back for propagation. Transient
    /// contention past `max_attempts` comes back as
    /// [`Error::RetriesExhausted`].
    pub fn recover(&self, err: Error) -> Result<()> {
        if !self.opts.retry_on_contention || !err.is_contention() {
            return Err(err);
        }
        if self.opts.max_attempts.is_some_and(|cap| self.attempts >= cap) {
            return Err(match err {
                Error::Storage(source) => Error::RetriesExhausted {
                    attempts: self.attempts,
                    source,
                },
                other => other,
            });
        }
        tracing::debug!(
            attempts = self.attempts,
            "transaction hit lock contention, retrying"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // connect_lazy never dials out, but pool construction spawns
    // maintenance tasks and needs a runtime
    fn lazy_pool() -> PgPool {
        PgPool::connect_lazy("postgres://localhost/unreachable").unwrap()
    }

    #[tokio::test]
    async fn recover_propagates_non_contention_errors() {
        let pool = lazy_pool();
        let runner = Runner::new(&pool, TxnOptions::mutation(false, None));

        let err = runner
            .recover(Error::Storage(sqlx::Error::PoolTimedOut))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let err = runner
            .recover(Error::Validation("bad".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn recover_never_retries_when_policy_says_no() {
        let pool = lazy_pool();
        let runner = Runner::new(&pool, TxnOptions::read(Isolation::ReadCommitted));

        let err = runner
            .recover(Error::Storage(sqlx::Error::PoolTimedOut))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn isolation_sql_spelling() {
        assert_eq!(Isolation::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(Isolation::Serializable.as_sql(), "SERIALIZABLE");
    }
}
