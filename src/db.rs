use crate::runs::StoreError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Opens a fresh connection with pragmas applied and the schema in place.
///
/// Every request and every stage opens its own connection; runs never share
/// one, so concurrent runs only contend on SQLite's own locking.
pub fn open_connection(db_path: &Path) -> Result<Connection, StoreError> {
    let mut connection = Connection::open(db_path)
        .map_err(|e| StoreError::Db(format!("Failed to open sqlite db: {e}")))?;
    configure_connection(&connection)?;
    bootstrap_schema(&mut connection)?;
    Ok(connection)
}

pub fn configure_connection(connection: &Connection) -> Result<(), StoreError> {
    connection
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .map_err(|e| StoreError::Db(format!("Failed to set busy timeout: {e}")))?;
    connection
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(|e| StoreError::Db(format!("Failed to enable WAL journal: {e}")))?;
    Ok(())
}

pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS analysis_runs (
              id TEXT PRIMARY KEY,
              address TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'queued',
              current_step TEXT NOT NULL DEFAULT 'initializing',
              cancel_requested INTEGER NOT NULL DEFAULT 0,
              imagery_json TEXT,
              analysis_json TEXT,
              pdf_url TEXT,
              metadata_json TEXT,
              error_message TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_runs_created_at
              ON analysis_runs (created_at DESC);

            CREATE TABLE IF NOT EXISTS run_events (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              from_status TEXT,
              to_status TEXT NOT NULL,
              current_step TEXT NOT NULL,
              message TEXT NOT NULL,
              created_at TEXT NOT NULL,
              FOREIGN KEY (run_id) REFERENCES analysis_runs(id)
            );

            CREATE INDEX IF NOT EXISTS idx_run_events_run_id
              ON run_events (run_id, seq);
            ",
        )
        .map_err(|e| StoreError::Db(format!("Failed to bootstrap schema: {e}")))?;

    Ok(())
}
