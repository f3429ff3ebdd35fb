use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::protocol_store::ProtocolRecordKind;

const MESSAGE_DB_FILE: &str = "inbound.sqlite3";

const SCHEMA: &str = "
    PRAGMA foreign_keys=ON;

    CREATE TABLE IF NOT EXISTS outgoing_messages (
        date_sent INTEGER NOT NULL,
        recipient TEXT NOT NULL,
        delivery_receipt_count INTEGER NOT NULL DEFAULT 0,
        receipt_timestamp INTEGER,
        PRIMARY KEY (date_sent, recipient)
    );
    CREATE TABLE IF NOT EXISTS message_send_log (
        date_sent INTEGER NOT NULL,
        recipient TEXT NOT NULL,
        device INTEGER NOT NULL,
        PRIMARY KEY (date_sent, recipient, device)
    );
    CREATE TABLE IF NOT EXISTS protocol_records (
        kind TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (kind, key)
    );
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0}")]
    Backend(String),
}

/// Writes available inside one storage transaction.
pub trait StoreTx {
    /// Bumps the delivery count on the outgoing message `timestamp` sent to
    /// `recipient`. Returns whether such a message exists.
    fn increment_delivery_receipt_count(
        &mut self,
        timestamp: u64,
        recipient: &str,
        receipt_time: u64,
    ) -> Result<bool, StoreError>;

    fn delete_send_log_entry(
        &mut self,
        timestamp: u64,
        recipient: &str,
        device: u32,
    ) -> Result<usize, StoreError>;

    fn load_protocol_record(
        &mut self,
        kind: ProtocolRecordKind,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// `None` deletes the record.
    fn write_protocol_record(
        &mut self,
        kind: ProtocolRecordKind,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<(), StoreError>;
}

pub trait MessageStore: Send + Sync {
    /// Runs `work` in one transaction: committed if it returns `Ok`, rolled
    /// back otherwise.
    fn run_in_transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

fn sql_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl StoreTx for Transaction<'_> {
    fn increment_delivery_receipt_count(
        &mut self,
        timestamp: u64,
        recipient: &str,
        receipt_time: u64,
    ) -> Result<bool, StoreError> {
        let updated = self.execute(
            "UPDATE outgoing_messages
             SET delivery_receipt_count = delivery_receipt_count + 1,
                 receipt_timestamp = MAX(IFNULL(receipt_timestamp, 0), ?3)
             WHERE date_sent = ?1 AND recipient = ?2",
            params![sql_i64(timestamp), recipient, sql_i64(receipt_time)],
        )?;
        Ok(updated > 0)
    }

    fn delete_send_log_entry(
        &mut self,
        timestamp: u64,
        recipient: &str,
        device: u32,
    ) -> Result<usize, StoreError> {
        Ok(self.execute(
            "DELETE FROM message_send_log WHERE date_sent = ?1 AND recipient = ?2 AND device = ?3",
            params![sql_i64(timestamp), recipient, device],
        )?)
    }

    fn load_protocol_record(
        &mut self,
        kind: ProtocolRecordKind,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .query_row(
                "SELECT value FROM protocol_records WHERE kind = ?1 AND key = ?2",
                params![kind.as_str(), key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn write_protocol_record(
        &mut self,
        kind: ProtocolRecordKind,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        match value {
            Some(bytes) => {
                self.execute(
                    "INSERT INTO protocol_records (kind, key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(kind, key) DO UPDATE SET value = excluded.value",
                    params![kind.as_str(), key, bytes],
                )?;
            }
            None => {
                self.execute(
                    "DELETE FROM protocol_records WHERE kind = ?1 AND key = ?2",
                    params![kind.as_str(), key],
                )?;
            }
        }
        Ok(())
    }
}

/// SQLite-backed message + protocol state store.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(data_dir.join(MESSAGE_DB_FILE))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn insert_outgoing_message(&self, timestamp: u64, recipient: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO outgoing_messages (date_sent, recipient) VALUES (?1, ?2)",
            params![sql_i64(timestamp), recipient],
        )?;
        Ok(())
    }

    pub fn insert_send_log_entry(
        &self,
        timestamp: u64,
        recipient: &str,
        device: u32,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO message_send_log (date_sent, recipient, device) VALUES (?1, ?2, ?3)",
            params![sql_i64(timestamp), recipient, device],
        )?;
        Ok(())
    }

    pub fn delivery_receipt_count(
        &self,
        timestamp: u64,
        recipient: &str,
    ) -> Result<Option<u32>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT delivery_receipt_count FROM outgoing_messages WHERE date_sent = ?1 AND recipient = ?2",
                params![sql_i64(timestamp), recipient],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn send_log_entries(&self, timestamp: u64, recipient: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM message_send_log WHERE date_sent = ?1 AND recipient = ?2",
            params![sql_i64(timestamp), recipient],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn protocol_record(
        &self,
        kind: ProtocolRecordKind,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM protocol_records WHERE kind = ?1 AND key = ?2",
                params![kind.as_str(), key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl MessageStore for SqliteMessageStore {
    fn run_in_transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let mut tx = conn.transaction()?;
        work(&mut tx)?;
        tx.commit()?;
        Ok(())
    }
}
