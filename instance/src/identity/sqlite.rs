//! SQLite backed identity store

use super::{IdentityStore, StoreError, SyncToken};
use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    /// Opens and validates the database, retrying with a fixed delay.
    /// Waits between attempts on the tokio timer so runtime workers stay free.
    pub async fn connect(path: &Path, attempts: u32, delay: Duration) -> Result<Self, StoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = Self::open(path).and_then(|store| {
                store.test()?;
                Ok(store)
            });

            match result {
                Ok(store) => return Ok(store),
                Err(StoreError::Database(source)) if attempt >= attempts => {
                    return Err(StoreError::Unavailable { attempts, source });
                }
                Err(StoreError::Database(e)) => {
                    warn!(
                        "Database connection attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS server_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_name TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                reporter_uuid TEXT NOT NULL,
                reported_uuid TEXT NOT NULL,
                reason TEXT NOT NULL,
                server_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_server_tokens_token
                ON server_tokens(token);
            CREATE INDEX IF NOT EXISTS idx_reports_server_name
                ON reports(server_name);",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a report attributed to `server_name`, returning its id
    pub fn record_report(
        &self,
        reporter_uuid: &str,
        reported_uuid: &str,
        reason: &str,
        server_name: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO reports (reporter_uuid, reported_uuid, reason, server_name)
             VALUES (?1, ?2, ?3, ?4)",
            params![reporter_uuid, reported_uuid, reason, server_name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Ids of reports attributed to `server_name`, oldest first
    pub fn reports_for(&self, server_name: &str) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM reports WHERE server_name = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![server_name], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn token_for(&self, server_name: &str) -> Result<Option<String>, StoreError> {
        let token = self
            .conn()
            .query_row(
                "SELECT token FROM server_tokens WHERE server_name = ?1",
                params![server_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl IdentityStore for SqliteIdentityStore {
    fn test(&self) -> Result<(), StoreError> {
        self.conn().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn token_name(&self, token: &SyncToken) -> Result<Option<String>, StoreError> {
        let name = self
            .conn()
            .query_row(
                "SELECT server_name FROM server_tokens WHERE token = ?1",
                params![token.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    fn insert_identity(&self, token: &SyncToken, name: &str) -> Result<(), StoreError> {
        match self.conn().execute(
            "INSERT INTO server_tokens (server_name, token) VALUES (?1, ?2)",
            params![name, token.as_str()],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::NameTaken(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn rename_identity(
        &self,
        token: &SyncToken,
        old_name: &str,
        new_name: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        // Dropping the transaction without commit rolls both writes back
        let tx = conn.transaction()?;

        if let Err(e) = tx.execute(
            "UPDATE server_tokens SET server_name = ?1 WHERE token = ?2",
            params![new_name, token.as_str()],
        ) {
            if is_unique_violation(&e) {
                return Err(StoreError::NameTaken(new_name.to_string()));
            }
            return Err(e.into());
        }

        let retagged = tx.execute(
            "UPDATE reports SET server_name = ?1 WHERE server_name = ?2",
            params![new_name, old_name],
        )?;

        tx.commit()?;
        Ok(retagged)
    }

    fn reassign_token(&self, name: &str, token: &SyncToken) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE server_tokens SET token = ?1 WHERE server_name = ?2",
            params![token.as_str(), name],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO server_tokens (server_name, token) VALUES (?1, ?2)",
                params![name, token.as_str()],
            )?;
        }
        Ok(())
    }

    fn distinct_names(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(DISTINCT server_name) FROM server_tokens",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
