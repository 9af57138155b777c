use anyhow::Result;
use rusqlite::Connection;

pub(super) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pairs (
            id TEXT PRIMARY KEY,
            member_a TEXT NOT NULL,
            member_b TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'stopped',
            turn_counter INTEGER NOT NULL DEFAULT 0,
            mode TEXT NOT NULL DEFAULT '{\"kind\":\"generated\"}',
            waiting_for_reply INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            lease_holder TEXT,
            lease_expires_at INTEGER,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            last_activity_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_pairs_status ON pairs(status);

        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pair_id TEXT NOT NULL,
            turn_index INTEGER NOT NULL,
            from_member TEXT NOT NULL,
            to_member TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            driver TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_turns_pair ON turns(pair_id, id DESC);
        ",
    )?;

    Ok(())
}
