//! Mutating protocol operations: add, get, did, unlock, bump, remove.
//!
//! Each operation validates its parameters, assembles its SQL once, then
//! drives it through the transaction runner. An empty id slice is always
//! a no-op that returns zero without touching the store.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::txn::{Isolation, Runner, TxnOptions};
use crate::{Key, TaskLoop};

// ---------------------------------------------------------------------------
// add / remove
// ---------------------------------------------------------------------------

/// Add ids to the loop. Insertion is idempotent; re-adding an existing id
/// is a no-op. With `mark_completed`, new rows start with
/// `last_completed = now` instead of NULL, so they won't be handed out
/// until the recycle interval has passed.
///
/// Returns the number of ids that were actually new.
pub async fn add<I: Key>(
    q: &TaskLoop<I>,
    ids: &[I],
    mark_completed: bool,
    dry_run: bool,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let table = q.quoted_table();
    let sql = if mark_completed {
        let rows: Vec<String> = (0..ids.len()).map(|i| format!("(${}, $1)", i + 2)).collect();
        format!(
            "INSERT INTO {table} (id, last_completed) VALUES {} ON CONFLICT (id) DO NOTHING",
            rows.join(", ")
        )
    } else {
        format!(
            "INSERT INTO {table} (id) VALUES {} ON CONFLICT (id) DO NOTHING",
            (0..ids.len())
                .map(|i| format!("(${})", i + 1))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    let mut runner = Runner::new(q.pool(), TxnOptions::mutation(dry_run, q.retry_cap()));
    loop {
        let attempt = add_once(&mut runner, &sql, ids, mark_completed).await;
        match attempt {
            Ok(n) => return Ok(n),
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn add_once<I: Key>(
    runner: &mut Runner<'_>,
    sql: &str,
    ids: &[I],
    mark_completed: bool,
) -> Result<u64> {
    let mut tx = runner.begin().await?;
    let mut insert = sqlx::query(sql);
    if mark_completed {
        insert = insert.bind(Utc::now());
    }
    for id in ids {
        insert = insert.bind(id);
    }
    let n = insert.execute(&mut *tx).await?.rows_affected();
    runner.finish(tx, n).await
}

/// Remove ids from the loop entirely. Returns the number of rows deleted.
pub async fn remove<I: Key>(q: &TaskLoop<I>, ids: &[I], dry_run: bool) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "DELETE FROM {} WHERE id IN ({})",
        q.quoted_table(),
        placeholders(1, ids.len())
    );

    let mut runner = Runner::new(q.pool(), TxnOptions::mutation(dry_run, q.retry_cap()));
    loop {
        let attempt = remove_once(&mut runner, &sql, ids).await;
        match attempt {
            Ok(n) => return Ok(n),
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn remove_once<I: Key>(runner: &mut Runner<'_>, sql: &str, ids: &[I]) -> Result<u64> {
    let mut tx = runner.begin().await?;
    let mut delete = sqlx::query(sql);
    for id in ids {
        delete = delete.bind(id);
    }
    let n = delete.execute(&mut *tx).await?.rows_affected();
    runner.finish(tx, n).await
}

// ---------------------------------------------------------------------------
// get
// ---------------------------------------------------------------------------

/// Lease up to `limit` ids, most urgent first, and return them in order.
///
/// Selection runs as two ranked scans inside one transaction:
///
/// 1. ids whose lease has expired (crashed workers, and anything whose
///    lease [`bump`] pulled into the past), oldest lease first;
/// 2. unleased ids whose last completion is at least `min_recycle`
///    seconds old, never-completed ids first, then stalest first.
///
/// Every returned id has its `lease_until` set to now + `lease_for`
/// seconds under the same locks as the scans, so no concurrent `get` can
/// hand out the same id until that lease expires or is released.
///
/// `lease_for` must be positive: a conservative upper bound on how long
/// processing one id takes. `min_recycle` may be negative ("always
/// eligible"). A `limit` of zero returns an empty batch without I/O, and
/// an exhausted loop returns a short or empty batch, never an error.
pub async fn get<I: Key>(
    q: &TaskLoop<I>,
    limit: u64,
    lease_for: f64,
    min_recycle: f64,
    dry_run: bool,
) -> Result<Vec<I>> {
    validate_positive("lease_for", lease_for)?;
    validate_number("min_recycle", min_recycle)?;
    if limit == 0 {
        return Ok(Vec::new());
    }

    let table = q.quoted_table();

    // Unlocked probe for the expired-lease tier. When it comes up empty
    // the main transaction skips that scan and, with it, the collection
    // lock: the unleased tier is safe under plain row locks. An id whose
    // lease expires between probe and scan just waits for the next get.
    let expired: Option<(i32,)> = sqlx::query_as(&format!(
        "SELECT 1 FROM {table} WHERE lease_until IS NOT NULL AND lease_until <= $1 LIMIT 1"
    ))
    .bind(Utc::now())
    .fetch_optional(q.pool())
    .await?;
    let scan_expired = expired.is_some();

    // The expired-lease scan is an ordered range scan followed by an
    // update of the selected rows; serializing on the collection keeps
    // two such scans from deadlocking each other row by row.
    let opts = TxnOptions {
        isolation: Isolation::ReadCommitted,
        lock_table: scan_expired.then(|| q.table()),
        read_only: dry_run,
        retry_on_contention: true,
        max_attempts: q.retry_cap(),
    };
    let mut runner = Runner::new(q.pool(), opts);
    loop {
        let attempt = get_once(&mut runner, &table, limit, lease_for, min_recycle, scan_expired).await;
        match attempt {
            Ok(ids) => {
                tracing::debug!(table = q.table(), leased = ids.len(), "leased batch");
                return Ok(ids);
            }
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn get_once<I: Key>(
    runner: &mut Runner<'_>,
    table: &str,
    limit: u64,
    lease_for: f64,
    min_recycle: f64,
    scan_expired: bool,
) -> Result<Vec<I>> {
    let mut tx = runner.begin().await?;
    let now = Utc::now();
    let limit = limit.min(i64::MAX as u64) as i64;

    let mut ids: Vec<I> = Vec::new();
    let mut seen: HashSet<I> = HashSet::new();

    if scan_expired {
        let rows: Vec<(I,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} \
             WHERE lease_until IS NOT NULL AND lease_until <= $1 \
             ORDER BY lease_until ASC, last_completed ASC NULLS FIRST, id ASC \
             LIMIT $2 \
             FOR UPDATE"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        for (id,) in rows {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }

    if (ids.len() as i64) < limit {
        let rows: Vec<(I,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} \
             WHERE lease_until IS NULL \
               AND (last_completed IS NULL OR last_completed <= $1) \
             ORDER BY last_completed ASC NULLS FIRST, id ASC \
             LIMIT $2 \
             FOR UPDATE"
        ))
        .bind(now - duration(min_recycle))
        .bind(limit - ids.len() as i64)
        .fetch_all(&mut *tx)
        .await?;
        for (id,) in rows {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }

    if ids.is_empty() {
        return runner.finish(tx, ids).await;
    }

    let sql = format!(
        "UPDATE {table} SET lease_until = $1 WHERE id IN ({})",
        placeholders(2, ids.len())
    );
    let mut update = sqlx::query(&sql).bind(now + duration(lease_for));
    for id in &ids {
        update = update.bind(id);
    }
    update.execute(&mut *tx).await?;

    runner.finish(tx, ids).await
}

// ---------------------------------------------------------------------------
// did / unlock
// ---------------------------------------------------------------------------

/// Mark ids completed now and release their leases. Legal for ids with no
/// active lease (proactive completion). With `auto_add`, absent ids are
/// created first.
///
/// The returned count is advisory only — a sanity check, not something to
/// base correctness on.
pub async fn did<I: Key>(q: &TaskLoop<I>, ids: &[I], auto_add: bool, dry_run: bool) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let table = q.quoted_table();
    let insert_sql = auto_add.then(|| insert_missing_sql(&table, ids.len()));
    let update_sql = format!(
        "UPDATE {table} SET last_completed = $1, lease_until = NULL WHERE id IN ({})",
        placeholders(2, ids.len())
    );

    let mut runner = Runner::new(q.pool(), TxnOptions::mutation(dry_run, q.retry_cap()));
    loop {
        let attempt = did_once(&mut runner, insert_sql.as_deref(), &update_sql, ids).await;
        match attempt {
            Ok(n) => return Ok(n),
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn did_once<I: Key>(
    runner: &mut Runner<'_>,
    insert_sql: Option<&str>,
    update_sql: &str,
    ids: &[I],
) -> Result<u64> {
    let mut tx = runner.begin().await?;
    if let Some(sql) = insert_sql {
        let mut insert = sqlx::query(sql);
        for id in ids {
            insert = insert.bind(id);
        }
        insert.execute(&mut *tx).await?;
    }
    let mut update = sqlx::query(update_sql).bind(Utc::now());
    for id in ids {
        update = update.bind(id);
    }
    let n = update.execute(&mut *tx).await?.rows_affected();
    runner.finish(tx, n).await
}

/// Release leases without marking anything completed: the ids go back
/// into circulation at the priority they already had, since
/// `last_completed` is untouched. With `auto_add`, absent ids are created
/// first; those are born unleased, so the advisory count tallies each id
/// at most once (inserted or unleased, never both).
pub async fn unlock<I: Key>(
    q: &TaskLoop<I>,
    ids: &[I],
    auto_add: bool,
    dry_run: bool,
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let table = q.quoted_table();
    let insert_sql = auto_add.then(|| insert_missing_sql(&table, ids.len()));
    let update_sql = format!(
        "UPDATE {table} SET lease_until = NULL \
         WHERE lease_until IS NOT NULL AND id IN ({})",
        placeholders(1, ids.len())
    );

    let mut runner = Runner::new(q.pool(), TxnOptions::mutation(dry_run, q.retry_cap()));
    loop {
        let attempt = unlock_once(&mut runner, insert_sql.as_deref(), &update_sql, ids).await;
        match attempt {
            Ok(n) => return Ok(n),
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn unlock_once<I: Key>(
    runner: &mut Runner<'_>,
    insert_sql: Option<&str>,
    update_sql: &str,
    ids: &[I],
) -> Result<u64> {
    let mut tx = runner.begin().await?;
    let mut added = 0;
    if let Some(sql) = insert_sql {
        let mut insert = sqlx::query(sql);
        for id in ids {
            insert = insert.bind(id);
        }
        added = insert.execute(&mut *tx).await?.rows_affected();
    }
    let mut update = sqlx::query(update_sql);
    for id in ids {
        update = update.bind(id);
    }
    let unleased = update.execute(&mut *tx).await?.rows_affected();
    runner.finish(tx, added + unleased).await
}

// ---------------------------------------------------------------------------
// bump
// ---------------------------------------------------------------------------

/// Move ids toward the front of the queue by adjusting their lease.
///
/// Sets `lease_until = now + lease_for`, but only where the current lease
/// is NULL or later than that — bump only ever moves a lease earlier, so
/// a runaway bump loop can never keep an id locked forever, and bumping
/// an already-more-urgent id is a no-op.
///
/// `lease_for = 0` gives front-of-queue priority without locking.
/// Negative values push the apparent lease into the past for
/// super-priority. Positive values keep the id locked that long before it
/// becomes eligible, which coalesces repeated bumps into one future pass.
pub async fn bump<I: Key>(
    q: &TaskLoop<I>,
    ids: &[I],
    lease_for: f64,
    auto_add: bool,
    dry_run: bool,
) -> Result<u64> {
    validate_number("lease_for", lease_for)?;
    if ids.is_empty() {
        return Ok(0);
    }
    let table = q.quoted_table();
    let insert_sql = auto_add.then(|| insert_missing_sql(&table, ids.len()));
    let update_sql = format!(
        "UPDATE {table} SET lease_until = $1 \
         WHERE (lease_until IS NULL OR lease_until > $1) AND id IN ({})",
        placeholders(2, ids.len())
    );

    let mut runner = Runner::new(q.pool(), TxnOptions::mutation(dry_run, q.retry_cap()));
    loop {
        let attempt = bump_once(&mut runner, insert_sql.as_deref(), &update_sql, ids, lease_for).await;
        match attempt {
            Ok(n) => return Ok(n),
            Err(e) => runner.recover(e)?,
        }
    }
}

async fn bump_once<I: Key>(
    runner: &mut Runner<'_>,
    insert_sql: Option<&str>,
    update_sql: &str,
    ids: &[I],
    lease_for: f64,
) -> Result<u64> {
    let mut tx = runner.begin().await?;
    if let Some(sql) = insert_sql {
        let mut insert = sqlx::query(sql);
        for id in ids {
            insert = insert.bind(id);
        }
        insert.execute(&mut *tx).await?;
    }
    let mut update = sqlx::query(update_sql).bind(Utc::now() + duration(lease_for));
    for id in ids {
        update = update.bind(id);
    }
    let n = update.execute(&mut *tx).await?.rows_affected();
    runner.finish(tx, n).await
}

// ---------------------------------------------------------------------------
// shared helpers
// ---------------------------------------------------------------------------

/// `$start, $start+1, ...` for an n-element IN list.
pub(crate) fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_missing_sql(table: &str, n: usize) -> String {
    format!(
        "INSERT INTO {table} (id) VALUES {} ON CONFLICT (id) DO NOTHING",
        (0..n)
            .map(|i| format!("(${})", i + 1))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Largest duration magnitude the API accepts, in seconds (~3,200 years).
/// Anything past this cannot be added to a timestamp without leaving the
/// representable datetime range, so the validators reject it up front.
pub(crate) const MAX_DURATION_SECS: f64 = 1e11;

/// Seconds (fractional, either sign) as a chrono duration, at millisecond
/// precision. The store keeps microseconds, the API speaks seconds.
/// Callers validate against [`MAX_DURATION_SECS`] first.
pub(crate) fn duration(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}

/// Seconds from `from` to `to`, negative when `to` is earlier.
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

pub(crate) fn validate_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{name} must be a positive number of seconds at most {MAX_DURATION_SECS:e}, got {value}"
        )))
    }
}

pub(crate) fn validate_number(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value.abs() <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{name} must be a number of seconds within ±{MAX_DURATION_SECS:e}, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(1, 1), "$1");
        assert_eq!(placeholders(2, 3), "$2, $3, $4");
    }

    #[test]
    fn insert_missing_shape() {
        assert_eq!(
            insert_missing_sql("\"loop\"", 2),
            "INSERT INTO \"loop\" (id) VALUES ($1), ($2) ON CONFLICT (id) DO NOTHING"
        );
    }

    #[test]
    fn durations_keep_sign_and_fraction() {
        assert_eq!(duration(1.5).num_milliseconds(), 1500);
        assert_eq!(duration(-3600.0).num_seconds(), -3600);
        assert_eq!(duration(0.0004).num_milliseconds(), 0);
    }

    #[test]
    fn validation() {
        assert!(validate_positive("x", 20.5).is_ok());
        assert!(validate_positive("x", 0.0).is_err());
        assert!(validate_positive("x", -600.0).is_err());
        assert!(validate_positive("x", f64::NAN).is_err());
        assert!(validate_positive("x", f64::INFINITY).is_err());

        assert!(validate_number("x", -11.1).is_ok());
        assert!(validate_number("x", 0.0).is_ok());
        assert!(validate_number("x", f64::NAN).is_err());
    }

    // a finite value can still overflow datetime arithmetic; the bound
    // keeps everything that passes validation representable
    #[test]
    fn validation_rejects_unrepresentable_durations() {
        assert!(validate_positive("x", 1e18).is_err());
        assert!(validate_number("x", 1e18).is_err());
        assert!(validate_number("x", -1e18).is_err());

        assert!(validate_positive("x", MAX_DURATION_SECS).is_ok());
        assert!(validate_number("x", -MAX_DURATION_SECS).is_ok());
    }

    #[test]
    fn bounded_durations_stay_in_datetime_range() {
        let now = Utc::now();
        let _ = now + duration(MAX_DURATION_SECS);
        let _ = now - duration(MAX_DURATION_SECS);
    }
}
