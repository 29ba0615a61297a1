//! Read-only introspection: per-id status and whole-loop stats.
//!
//! Audit reads run through the same transaction runner as everything
//! else, but with the read-only policy: the transaction always rolls
//! back, so monitoring can never advance visible state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::error::Result;
use crate::ops::{duration, placeholders, seconds_between, validate_number};
use crate::txn::{Isolation, Runner, TxnOptions};
use crate::{Key, TaskLoop};

/// Point-in-time status of one id, in seconds relative to read time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ItemStatus {
    /// Time since the id was last completed; `None` = never completed.
    pub since_completed: Option<f64>,
    /// Time until the current lease expires; `None` = not leased,
    /// negative = lease already expired (or bumped into the past).
    pub lease_remaining: Option<f64>,
}

/// Look up the status of specific ids. Ids with no row are simply absent
/// from the result. Ordinary isolation; no contention expected and none
/// tolerated — errors propagate on the first attempt.
pub async fn check<I: Key>(q: &TaskLoop<I>, ids: &[I]) -> Result<HashMap<I, ItemStatus>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT id, last_completed, lease_until FROM {} WHERE id IN ({})",
        q.quoted_table(),
        placeholders(1, ids.len())
    );

    let mut runner = Runner::new(q.pool(), TxnOptions::read(Isolation::ReadCommitted));
    let mut tx = runner.begin().await?;
    let now = Utc::now();
    let mut query = sqlx::query_as::<_, (I, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&mut *tx).await?;

    let statuses = rows
        .into_iter()
        .map(|(id, completed, lease)| {
            (
                id,
                ItemStatus {
                    since_completed: completed.map(|t| seconds_between(t, now)),
                    lease_remaining: lease.map(|t| seconds_between(now, t)),
                },
            )
        })
        .collect();
    runner.finish(tx, statuses).await
}

/// Aggregate health of one loop table.
///
/// Counts partition ids two ways: by lease (`leased` future lease,
/// `expired` past lease, the rest unleased) and by completion
/// (`never_completed` / `completed`). Extrema are seconds at read time,
/// `0.0` when the class they describe is empty; `min_id`/`max_id` are
/// `None` for an empty table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStats<I> {
    /// Ids currently leased (lease in the future).
    pub leased: u64,
    /// Ids whose lease is in the past: abandoned by a crashed worker, or
    /// bumped to the front of the queue.
    pub expired: u64,
    pub never_completed: u64,
    pub completed: u64,
    pub min_id: Option<I>,
    pub max_id: Option<I>,
    /// Remaining lease time across leased ids.
    pub min_lease_remaining: f64,
    pub max_lease_remaining: f64,
    /// How long expired leases have been expired.
    pub min_overdue: f64,
    pub max_overdue: f64,
    /// Time since completion across completed, unleased ids.
    pub min_since_completed: f64,
    pub max_since_completed: f64,
    /// `(threshold, count)` per requested staleness threshold: unleased
    /// ids never completed or completed at least `threshold` seconds ago.
    pub stale_counts: Vec<(f64, u64)>,
}

/// Collect loop-wide stats.
///
/// Requests READ UNCOMMITTED — the weakest level the store offers — since
/// monitoring tolerates slightly inconsistent numbers in exchange for
/// never waiting on writers. (Postgres runs it as READ COMMITTED; the
/// no-locks, no-retry policy stands either way.) Cross-aggregate skew
/// within one call is a documented trade-off, not a bug.
pub async fn stats<I: Key>(q: &TaskLoop<I>, thresholds: &[f64]) -> Result<LoopStats<I>> {
    for t in thresholds {
        validate_number("staleness threshold", *t)?;
    }
    let table = q.quoted_table();

    let mut runner = Runner::new(q.pool(), TxnOptions::read(Isolation::ReadUncommitted));
    let mut tx = runner.begin().await?;
    let now = Utc::now();

    type Ts = Option<DateTime<Utc>>;
    #[allow(clippy::type_complexity)]
    let (
        leased,
        expired,
        never_completed,
        completed,
        min_id,
        max_id,
        first_lease_end,
        last_lease_end,
        oldest_expired,
        newest_expired,
        oldest_completed,
        newest_completed,
    ): (i64, i64, i64, i64, Option<I>, Option<I>, Ts, Ts, Ts, Ts, Ts, Ts) = sqlx::query_as(
        &format!(
            "SELECT \
               count(*) FILTER (WHERE lease_until > $1), \
               count(*) FILTER (WHERE lease_until <= $1), \
               count(*) FILTER (WHERE last_completed IS NULL), \
               count(*) FILTER (WHERE last_completed IS NOT NULL), \
               min(id), \
               max(id), \
               min(lease_until) FILTER (WHERE lease_until > $1), \
               max(lease_until) FILTER (WHERE lease_until > $1), \
               min(lease_until) FILTER (WHERE lease_until <= $1), \
               max(lease_until) FILTER (WHERE lease_until <= $1), \
               min(last_completed) FILTER (WHERE lease_until IS NULL AND last_completed IS NOT NULL), \
               max(last_completed) FILTER (WHERE lease_until IS NULL AND last_completed IS NOT NULL) \
             FROM {table}"
        ),
    )
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    let mut stale_counts = Vec::with_capacity(thresholds.len());
    if !thresholds.is_empty() {
        let columns: Vec<String> = (0..thresholds.len())
            .map(|i| {
                format!(
                    "count(*) FILTER (WHERE lease_until IS NULL \
                     AND (last_completed IS NULL OR last_completed <= ${}))",
                    i + 1
                )
            })
            .collect();
        let sql = format!("SELECT {} FROM {table}", columns.join(", "));
        let mut query = sqlx::query(&sql);
        for t in thresholds {
            query = query.bind(now - duration(*t));
        }
        let row = query.fetch_one(&mut *tx).await?;
        for (i, t) in thresholds.iter().enumerate() {
            stale_counts.push((*t, row.try_get::<i64, _>(i)? as u64));
        }
    }

    let stats = LoopStats {
        leased: leased as u64,
        expired: expired as u64,
        never_completed: never_completed as u64,
        completed: completed as u64,
        min_id,
        max_id,
        min_lease_remaining: first_lease_end.map_or(0.0, |t| seconds_between(now, t)),
        max_lease_remaining: last_lease_end.map_or(0.0, |t| seconds_between(now, t)),
        // the most recently expired lease is the least overdue
        min_overdue: newest_expired.map_or(0.0, |t| seconds_between(t, now)),
        max_overdue: oldest_expired.map_or(0.0, |t| seconds_between(t, now)),
        min_since_completed: newest_completed.map_or(0.0, |t| seconds_between(t, now)),
        max_since_completed: oldest_completed.map_or(0.0, |t| seconds_between(t, now)),
        stale_counts,
    };
    runner.finish(tx, stats).await
}
