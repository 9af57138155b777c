mod helpers;
mod query;
mod schema;
mod write_ops;


use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use matura_core::{Pair, PairPatch, PairStatus, PairStore, StoreError, Turn, TurnCommit};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// SQLite-backed pair store.
///
/// A single connection behind a mutex; every trait method is one short
/// statement or one immediate transaction, so separate processes sharing
/// the file (the scheduler and the CLI) see consistent conditional updates.
/// Statements run on the blocking pool: a busy database file waits out
/// `busy_timeout` there, not on a runtime worker.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        schema::init_schema(&conn)?;
        debug!(path = %path.display(), "pair store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_poisoned| StoreError::Backend("pair store mutex poisoned".to_owned()))?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("pair store task failed: {e}")))?
    }
}

#[async_trait]
impl PairStore for SqliteStore {
    async fn create(&self, pair: &Pair) -> Result<(), StoreError> {
        let pair = pair.clone();
        self.with_conn(move |conn| write_ops::create(conn, &pair)).await
    }

    async fn get(&self, id: &str) -> Result<Option<Pair>, StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| query::get(conn, &id)).await
    }

    async fn list(&self) -> Result<Vec<Pair>, StoreError> {
        self.with_conn(|conn| query::list(conn, None)).await
    }

    async fn list_by_status(&self, status: PairStatus) -> Result<Vec<Pair>, StoreError> {
        self.with_conn(move |conn| query::list(conn, Some(status))).await
    }

    #[instrument(skip(self, patch), fields(status = ?patch.status))]
    async fn update(&self, id: &str, patch: &PairPatch) -> Result<Pair, StoreError> {
        let (id, patch) = (id.to_owned(), patch.clone());
        self.with_conn(move |conn| write_ops::update(conn, &id, &patch))
            .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| write_ops::delete(conn, &id)).await
    }

    async fn advance_turn(&self, id: &str, commit: &TurnCommit) -> Result<Pair, StoreError> {
        let (id, commit) = (id.to_owned(), commit.clone());
        self.with_conn(move |conn| write_ops::advance_turn(conn, &id, &commit))
            .await
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        let turn = turn.clone();
        self.with_conn(move |conn| write_ops::append_turn(conn, &turn))
            .await
    }

    async fn recent_turns(&self, id: &str, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let id = id.to_owned();
        self.with_conn(move |conn| query::recent_turns(conn, &id, limit))
            .await
    }

    async fn try_acquire_lease(
        &self,
        id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (id, holder) = (id.to_owned(), holder.to_owned());
        self.with_conn(move |conn| {
            write_ops::try_acquire_lease(conn, &id, &holder, now + ttl, now)
        })
        .await
    }

    async fn release_lease(&self, id: &str, holder: &str) -> Result<(), StoreError> {
        let (id, holder) = (id.to_owned(), holder.to_owned());
        self.with_conn(move |conn| write_ops::release_lease(conn, &id, &holder))
            .await
    }
}
