use chrono::{DateTime, Utc};
use matura_core::{Pair, PairPatch, PairStatus, StoreError, Turn, TurnCommit};
use rusqlite::{Connection, ErrorCode, TransactionBehavior, params};
use tracing::debug;

use super::helpers::{self, backend};
use super::query;

pub(super) fn create(conn: &Connection, pair: &Pair) -> Result<(), StoreError> {
    let result = conn.execute(
        "
        INSERT INTO pairs (
            id, member_a, member_b, active, status, turn_counter, mode,
            waiting_for_reply, last_error, created_at, started_at, last_activity_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            pair.id,
            pair.member_a,
            pair.member_b,
            pair.active,
            pair.status.as_str(),
            helpers::u64_to_sql(pair.turn_counter),
            helpers::mode_json(&pair.mode)?,
            pair.waiting_for_reply,
            pair.last_error,
            helpers::ms_from_dt(pair.created_at),
            pair.started_at.map(helpers::ms_from_dt),
            pair.last_activity_at.map(helpers::ms_from_dt),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(error, _))
            if error.code == ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::AlreadyExists(pair.id.clone()))
        }
        Err(error) => Err(backend(error)),
    }
}

/// Read, patch and write back inside an immediate transaction.
///
/// Only the columns a patch can touch are written, so a concurrent counter
/// advance from another process is never overwritten.
pub(super) fn update(
    conn: &mut Connection,
    id: &str,
    patch: &PairPatch,
) -> Result<Pair, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(backend)?;

    let mut pair = query::get(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
    let previous = pair.status;
    patch.apply(&mut pair)?;

    tx.execute(
        "
        UPDATE pairs
        SET active = ?, status = ?, started_at = ?, waiting_for_reply = ?,
            last_error = ?, mode = ?
        WHERE id = ?
        ",
        params![
            pair.active,
            pair.status.as_str(),
            pair.started_at.map(helpers::ms_from_dt),
            pair.waiting_for_reply,
            pair.last_error,
            helpers::mode_json(&pair.mode)?,
            id,
        ],
    )
    .map_err(backend)?;
    tx.commit().map_err(backend)?;

    if previous != pair.status {
        debug!(pair_id = id, from = %previous, to = %pair.status, "pair status changed");
    }
    Ok(pair)
}

pub(super) fn delete(conn: &mut Connection, id: &str) -> Result<bool, StoreError> {
    let tx = conn.transaction().map_err(backend)?;
    tx.execute("DELETE FROM turns WHERE pair_id = ?", params![id])
        .map_err(backend)?;
    let removed = tx
        .execute("DELETE FROM pairs WHERE id = ?", params![id])
        .map_err(backend)?;
    tx.commit().map_err(backend)?;
    Ok(removed > 0)
}

/// Conditional counter increment. A single UPDATE guarded on the expected
/// counter and running status; on zero affected rows the current row is
/// read to report why.
pub(super) fn advance_turn(
    conn: &mut Connection,
    id: &str,
    commit: &TurnCommit,
) -> Result<Pair, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(backend)?;

    let cursor = commit
        .cursor
        .map(|c| i64::try_from(c).unwrap_or(i64::MAX));

    let changed = tx
        .execute(
            "
            UPDATE pairs
            SET turn_counter = turn_counter + 1,
                last_activity_at = ?1,
                waiting_for_reply = 1,
                last_error = NULL,
                mode = CASE
                    WHEN ?2 IS NOT NULL AND json_extract(mode, '$.kind') = 'scripted'
                    THEN json_set(mode, '$.cursor', ?2)
                    ELSE mode
                END
            WHERE id = ?3 AND turn_counter = ?4 AND status = 'running'
            ",
            params![
                helpers::ms_from_dt(commit.at),
                cursor,
                id,
                helpers::u64_to_sql(commit.expected_counter),
            ],
        )
        .map_err(backend)?;

    let pair = query::get(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
    tx.commit().map_err(backend)?;

    if changed == 1 {
        return Ok(pair);
    }
    if pair.status != PairStatus::Running {
        return Err(StoreError::NotRunning {
            pair_id: id.to_owned(),
            status: pair.status,
        });
    }
    Err(StoreError::Conflict {
        pair_id: id.to_owned(),
        expected: commit.expected_counter,
        actual: pair.turn_counter,
    })
}

pub(super) fn append_turn(conn: &Connection, turn: &Turn) -> Result<(), StoreError> {
    let metadata = serde_json::to_string(&turn.metadata).map_err(backend)?;
    conn.execute(
        "
        INSERT INTO turns (
            pair_id, turn_index, from_member, to_member, content, timestamp, driver, metadata
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            turn.pair_id,
            helpers::u64_to_sql(turn.turn_index),
            turn.from_member,
            turn.to_member,
            turn.content,
            helpers::ms_from_dt(turn.timestamp),
            turn.driver.as_str(),
            metadata,
        ],
    )
    .map_err(backend)?;
    Ok(())
}

pub(super) fn try_acquire_lease(
    conn: &Connection,
    id: &str,
    holder: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            "
            UPDATE pairs
            SET lease_holder = ?2, lease_expires_at = ?3
            WHERE id = ?1
              AND (lease_holder IS NULL OR lease_holder = ?2 OR lease_expires_at <= ?4)
            ",
            params![
                id,
                holder,
                helpers::ms_from_dt(expires_at),
                helpers::ms_from_dt(now),
            ],
        )
        .map_err(backend)?;

    if changed == 1 {
        return Ok(true);
    }
    match query::get(conn, id)? {
        Some(_) => Ok(false),
        None => Err(StoreError::NotFound(id.to_owned())),
    }
}

pub(super) fn release_lease(conn: &Connection, id: &str, holder: &str) -> Result<(), StoreError> {
    conn.execute(
        "
        UPDATE pairs
        SET lease_holder = NULL, lease_expires_at = NULL
        WHERE id = ? AND lease_holder = ?
        ",
        params![id, holder],
    )
    .map_err(backend)?;
    Ok(())
}
