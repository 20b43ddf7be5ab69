//! Durable, append-only ledger of corn purchases.
//!
//! Records live in a single SQLite table indexed by `(client_id,
//! purchased_at_ms)`. All access goes through one connection guarded by a
//! mutex; [`Ledger::transaction`] holds that mutex and an immediate SQLite
//! write transaction for its whole closure, which is what makes the admission
//! check and the insert one atomic unit.

use crate::errors::PurchaseError;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

pub type RecordId = i64;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub id: RecordId,
    pub client_id: String,
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, PurchaseError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(
        path: &Path,
        busy_timeout: Duration,
    ) -> Result<Self, PurchaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                PurchaseError::storage(format!(
                    "failed to create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| PurchaseError::storage(format!("failed to open ledger db: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| PurchaseError::storage(format!("failed to set busy timeout: {e}")))?;
        let ledger = Self::from_connection(conn)?;
        info!(path = %path.display(), "purchase ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, PurchaseError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PurchaseError::storage(format!("failed to open in-memory ledger: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, PurchaseError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                purchased_at_ms INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| PurchaseError::storage(format!("failed to create purchases table: {e}")))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_purchases_client_time
             ON purchases(client_id, purchased_at_ms)",
            [],
        )
        .map_err(|e| {
            PurchaseError::storage(format!("failed to create idx_purchases_client_time: {e}"))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside one immediate transaction. Commits on `Ok`, rolls back
    /// on `Err` (the transaction is dropped uncommitted).
    pub fn transaction<T, F>(&self, f: F) -> Result<T, PurchaseError>
    where
        F: FnOnce(&LedgerTx<'_>) -> Result<T, PurchaseError>,
    {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                PurchaseError::storage(format!("failed to begin ledger transaction: {e}"))
            })?;
        let ledger_tx = LedgerTx { conn: &tx };
        let value = f(&ledger_tx)?;
        tx.commit().map_err(|e| {
            PurchaseError::storage(format!("failed to commit ledger transaction: {e}"))
        })?;
        Ok(value)
    }

    pub fn count_since(&self, client_id: &str, cutoff_millis: u64) -> Result<u64, PurchaseError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        count_since(&guard, client_id, cutoff_millis)
    }

    pub fn latest_since(
        &self,
        client_id: &str,
        cutoff_millis: u64,
    ) -> Result<Option<PurchaseRecord>, PurchaseError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        latest_since(&guard, client_id, cutoff_millis)
    }

    pub fn insert(
        &self,
        client_id: &str,
        timestamp_millis: u64,
    ) -> Result<RecordId, PurchaseError> {
        self.transaction(|tx| tx.insert(client_id, timestamp_millis))
    }

    pub fn total_count(&self, client_id: &str) -> Result<u64, PurchaseError> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        total_count(&guard, client_id)
    }

    #[cfg(test)]
    pub(crate) fn break_schema_for_test(&self) {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .execute("DROP TABLE purchases", [])
            .expect("drop purchases table");
    }
}

/// View of the ledger inside an open transaction.
pub struct LedgerTx<'a> {
    conn: &'a Connection,
}

impl LedgerTx<'_> {
    pub fn count_since(&self, client_id: &str, cutoff_millis: u64) -> Result<u64, PurchaseError> {
        count_since(self.conn, client_id, cutoff_millis)
    }

    pub fn latest_since(
        &self,
        client_id: &str,
        cutoff_millis: u64,
    ) -> Result<Option<PurchaseRecord>, PurchaseError> {
        latest_since(self.conn, client_id, cutoff_millis)
    }

    pub fn insert(
        &self,
        client_id: &str,
        timestamp_millis: u64,
    ) -> Result<RecordId, PurchaseError> {
        let timestamp = to_sql_millis(timestamp_millis)?;
        self.conn
            .execute(
                "INSERT INTO purchases (client_id, purchased_at_ms) VALUES (?1, ?2)",
                params![client_id, timestamp],
            )
            .map_err(|e| PurchaseError::storage(format!("failed to insert purchase: {e}")))?;
        let id = self.conn.last_insert_rowid();
        debug!(client_id, id, timestamp_millis, "purchase recorded");
        Ok(id)
    }
}

fn count_since(
    conn: &Connection,
    client_id: &str,
    cutoff_millis: u64,
) -> Result<u64, PurchaseError> {
    let cutoff = to_sql_millis(cutoff_millis)?;
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM purchases WHERE client_id = ?1 AND purchased_at_ms > ?2",
            params![client_id, cutoff],
            |row| row.get(0),
        )
        .map_err(|e| PurchaseError::storage(format!("failed to count recent purchases: {e}")))?;
    Ok(count.max(0) as u64)
}

fn latest_since(
    conn: &Connection,
    client_id: &str,
    cutoff_millis: u64,
) -> Result<Option<PurchaseRecord>, PurchaseError> {
    let cutoff = to_sql_millis(cutoff_millis)?;
    conn.query_row(
        "SELECT id, client_id, purchased_at_ms
         FROM purchases
         WHERE client_id = ?1 AND purchased_at_ms > ?2
         ORDER BY purchased_at_ms DESC, id DESC
         LIMIT 1",
        params![client_id, cutoff],
        |row| {
            let purchased_at: i64 = row.get(2)?;
            Ok(PurchaseRecord {
                id: row.get(0)?,
                client_id: row.get(1)?,
                timestamp_millis: purchased_at.max(0) as u64,
            })
        },
    )
    .optional()
    .map_err(|e| PurchaseError::storage(format!("failed to load latest purchase: {e}")))
}

fn total_count(conn: &Connection, client_id: &str) -> Result<u64, PurchaseError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM purchases WHERE client_id = ?1",
            params![client_id],
            |row| row.get(0),
        )
        .map_err(|e| PurchaseError::storage(format!("failed to count purchases: {e}")))?;
    Ok(count.max(0) as u64)
}

fn to_sql_millis(millis: u64) -> Result<i64, PurchaseError> {
    i64::try_from(millis)
        .map_err(|_| PurchaseError::storage(format!("timestamp {millis} exceeds i64 range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn count_since_excludes_records_at_or_before_cutoff() {
        let ledger = Ledger::open_in_memory().expect("in-memory ledger");
        ledger.insert("alice", T0).unwrap();
        ledger.insert("alice", T0 + 10).unwrap();

        assert_eq!(ledger.count_since("alice", T0 - 1).unwrap(), 2);
        assert_eq!(ledger.count_since("alice", T0).unwrap(), 1);
        assert_eq!(ledger.count_since("alice", T0 + 10).unwrap(), 0);
        assert_eq!(ledger.count_since("bob", 0).unwrap(), 0);
    }

    #[test]
    fn record_ids_increase() {
        let ledger = Ledger::open_in_memory().unwrap();
        let first = ledger.insert("alice", T0).unwrap();
        let second = ledger.insert("bob", T0).unwrap();
        assert!(second > first);
    }

    #[test]
    fn latest_since_returns_newest_record() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.insert("alice", T0).unwrap();
        let newest = ledger.insert("alice", T0 + 500).unwrap();

        let latest = ledger.latest_since("alice", T0 - 1).unwrap().unwrap();
        assert_eq!(latest.id, newest);
        assert_eq!(latest.client_id, "alice");
        assert_eq!(latest.timestamp_millis, T0 + 500);
        assert!(ledger.latest_since("alice", T0 + 500).unwrap().is_none());
    }

    #[test]
    fn total_count_is_cumulative_per_client() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.insert("alice", T0).unwrap();
        ledger.insert("alice", T0 + 120_000).unwrap();
        ledger.insert("bob", T0).unwrap();

        assert_eq!(ledger.total_count("alice").unwrap(), 2);
        assert_eq!(ledger.total_count("bob").unwrap(), 1);
        assert_eq!(ledger.total_count("carol").unwrap(), 0);
    }

    #[test]
    fn failed_transaction_rolls_back_insert() {
        let ledger = Ledger::open_in_memory().unwrap();
        let result: Result<(), PurchaseError> = ledger.transaction(|tx| {
            tx.insert("alice", T0)?;
            Err(PurchaseError::storage("simulated failure after insert"))
        });

        assert!(matches!(result, Err(PurchaseError::StorageFailure(_))));
        assert_eq!(ledger.total_count("alice").unwrap(), 0);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let ledger = Ledger::open_in_memory().unwrap();
        let seen = ledger
            .transaction(|tx| {
                tx.insert("alice", T0)?;
                tx.count_since("alice", T0 - 1)
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn timestamps_beyond_i64_are_storage_failures() {
        let ledger = Ledger::open_in_memory().unwrap();
        let err = ledger.insert("alice", u64::MAX).unwrap_err();
        assert!(matches!(err, PurchaseError::StorageFailure(_)));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.sqlite");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.insert("alice", T0).unwrap();
        }

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.total_count("alice").unwrap(), 1);
        assert_eq!(reopened.count_since("alice", T0 - 1).unwrap(), 1);
    }
}
