use matura_core::{Pair, PairStatus, StoreError, Turn};
use rusqlite::{Connection, OptionalExtension, params};

use super::helpers::{self, PAIR_COLUMNS, TURN_COLUMNS, backend};

pub(super) fn get(conn: &Connection, id: &str) -> Result<Option<Pair>, StoreError> {
    conn.query_row(
        &format!("SELECT {PAIR_COLUMNS} FROM pairs WHERE id = ?"),
        params![id],
        helpers::pair_from_row,
    )
    .optional()
    .map_err(backend)
}

pub(super) fn list(
    conn: &Connection,
    status: Option<PairStatus>,
) -> Result<Vec<Pair>, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PAIR_COLUMNS} FROM pairs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, id"
        ))
        .map_err(backend)?;

    let rows = stmt
        .query_map(params![status.map(PairStatus::as_str)], helpers::pair_from_row)
        .map_err(backend)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)?);
    }
    Ok(out)
}

/// Last `limit` turns of a pair, oldest first.
pub(super) fn recent_turns(
    conn: &Connection,
    id: &str,
    limit: usize,
) -> Result<Vec<Turn>, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM turns
             WHERE pair_id = ?
             ORDER BY id DESC
             LIMIT ?"
        ))
        .map_err(backend)?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![id, limit], helpers::turn_from_row)
        .map_err(backend)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(backend)?);
    }
    out.reverse();
    Ok(out)
}
