use crate::errors::{SyncError, SyncResult};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS scheduler_runs (
  user_id TEXT PRIMARY KEY,
  last_run_date TEXT NOT NULL
);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Small on-disk state the engine keeps outside the remote store: currently
/// just the recurring scheduler's per-user last-run-date marker, which is
/// what makes the daily pass idempotent across restarts.
#[derive(Debug)]
pub struct LocalState {
    conn: Mutex<Connection>,
}

impl LocalState {
    pub fn new(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Internal(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Test/ephemeral variant; nothing survives the process.
    pub fn in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn last_run_date(&self, user_id: &str) -> SyncResult<Option<NaiveDate>> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT last_run_date FROM scheduler_runs WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(text) => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                .map(Some)
                .map_err(|err| SyncError::Internal(format!("bad run marker {text:?}: {err}"))),
            None => Ok(None),
        }
    }

    pub fn set_last_run_date(&self, user_id: &str, date: NaiveDate) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scheduler_runs (user_id, last_run_date) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_run_date = excluded.last_run_date",
            params![user_id, date.format(DATE_FORMAT).to_string()],
        )?;
        Ok(())
    }

    fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Internal("local state mutex poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips_per_user() {
        let state = LocalState::in_memory().expect("open");
        assert_eq!(state.last_run_date("u1").expect("read"), None);

        let date = NaiveDate::from_ymd_opt(2026, 8, 28).expect("date");
        state.set_last_run_date("u1", date).expect("write");
        assert_eq!(state.last_run_date("u1").expect("read"), Some(date));
        assert_eq!(state.last_run_date("u2").expect("read"), None);

        let next = NaiveDate::from_ymd_opt(2026, 8, 29).expect("date");
        state.set_last_run_date("u1", next).expect("overwrite");
        assert_eq!(state.last_run_date("u1").expect("read"), Some(next));
    }

    #[test]
    fn marker_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("taskmirror.db");
        let date = NaiveDate::from_ymd_opt(2026, 8, 28).expect("date");
        {
            let state = LocalState::new(&path).expect("open");
            state.set_last_run_date("u1", date).expect("write");
        }
        let reopened = LocalState::new(&path).expect("reopen");
        assert_eq!(reopened.last_run_date("u1").expect("read"), Some(date));
    }
}
