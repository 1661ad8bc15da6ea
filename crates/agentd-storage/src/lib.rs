//! agentd-storage: SQLite persistence for the agent task queue and the scheduler.
//!
//! Two tables, each owned by exactly one manager:
//! - `agent_tasks` (TaskManager)
//! - `scheduled_tasks` (SchedulerService)

mod agent_tasks;
mod scheduled_tasks;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::Connection;
use rusqlite::types::Type;
use tokio::sync::Mutex;

use agentd_types::UnknownVariant;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agent_tasks (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    sequence INTEGER NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    result_summary TEXT,
    fail_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_tasks_status_sequence
    ON agent_tasks (status, sequence);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    type TEXT NOT NULL,
    schedule TEXT NOT NULL,
    status TEXT NOT NULL,
    next_run_time INTEGER NOT NULL DEFAULT 0,
    last_run_time INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    created_by TEXT NOT NULL DEFAULT 'user',
    fail_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_status_next_run
    ON scheduled_tasks (status, next_run_time);
";

/// SQLite-backed store shared by the task manager and the scheduler.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL lets the CLI read while the gateway writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let storage = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "Storage opened");
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

/// Parse a TEXT column holding one of the wire enums.
fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
