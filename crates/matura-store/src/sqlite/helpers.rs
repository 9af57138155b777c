use chrono::{DateTime, TimeZone, Utc};
use matura_core::{
    DriverKind, Lease, Pair, PairStatus, SchedulingMode, StoreError, Turn, TurnMetadata,
};
use rusqlite::Row;
use rusqlite::types::Type;

/// Column list matching [`pair_from_row`].
pub(super) const PAIR_COLUMNS: &str = "
    id, member_a, member_b, active, status, turn_counter, mode,
    waiting_for_reply, last_error, lease_holder, lease_expires_at,
    created_at, started_at, last_activity_at
";

/// Column list matching [`turn_from_row`].
pub(super) const TURN_COLUMNS: &str = "
    pair_id, turn_index, from_member, to_member, content, timestamp, driver, metadata
";

pub(super) fn backend(error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(error.to_string())
}

fn conversion_error(
    idx: usize,
    error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error.into())
}

pub(super) fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<Pair> {
    let status: String = row.get(4)?;
    let status = status
        .parse::<PairStatus>()
        .map_err(|e| conversion_error(4, e.to_string()))?;

    let mode: String = row.get(6)?;
    let mode: SchedulingMode = serde_json::from_str(&mode).map_err(|e| conversion_error(6, e))?;

    let lease_holder: Option<String> = row.get(9)?;
    let lease_expires_at: Option<i64> = row.get(10)?;
    let lease = lease_holder
        .zip(lease_expires_at)
        .map(|(holder, expires_at)| Lease {
            holder,
            expires_at: dt_from_ms(expires_at),
        });

    Ok(Pair {
        id: row.get(0)?,
        member_a: row.get(1)?,
        member_b: row.get(2)?,
        active: row.get(3)?,
        status,
        turn_counter: u64_from_sql(row.get(5)?),
        mode,
        waiting_for_reply: row.get(7)?,
        last_error: row.get(8)?,
        lease,
        created_at: dt_from_ms(row.get(11)?),
        started_at: row.get::<_, Option<i64>>(12)?.map(dt_from_ms),
        last_activity_at: row.get::<_, Option<i64>>(13)?.map(dt_from_ms),
    })
}

pub(super) fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let driver: String = row.get(6)?;
    let driver = driver
        .parse::<DriverKind>()
        .map_err(|e| conversion_error(6, e.to_string()))?;

    let metadata: String = row.get(7)?;
    let metadata: TurnMetadata = serde_json::from_str(&metadata).unwrap_or_default();

    Ok(Turn {
        pair_id: row.get(0)?,
        turn_index: u64_from_sql(row.get(1)?),
        from_member: row.get(2)?,
        to_member: row.get(3)?,
        content: row.get(4)?,
        timestamp: dt_from_ms(row.get(5)?),
        driver,
        metadata,
    })
}

pub(super) fn mode_json(mode: &SchedulingMode) -> Result<String, StoreError> {
    serde_json::to_string(mode).map_err(backend)
}

pub(super) fn u64_to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(super) fn u64_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(super) fn ms_from_dt(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(super) fn dt_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}
