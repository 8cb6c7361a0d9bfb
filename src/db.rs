// Storage layer - SQLite with WAL
//
// Every request opens its own connection. Mutations run inside a single
// BEGIN IMMEDIATE transaction, so the read-modify-write of a transaction row
// or a rating summary is serialised by SQLite's write lock. Rows also carry a
// version column that updates compare-and-swap on; a miss is a Conflict and
// gets retried like lock contention.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{types::Type, Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ExchangeError, Result};

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Total attempts for an operation that keeps hitting transient faults
    pub max_attempts: u32,
    /// How long SQLite itself waits on a held lock before reporting BUSY
    pub busy_timeout: Duration,
    /// Base sleep between attempts (multiplied by the attempt number)
    pub backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            busy_timeout: Duration::from_millis(250),
            backoff: Duration::from_millis(20),
        }
    }
}

/// Connection factory over one database file
#[derive(Debug, Clone)]
pub struct Store {
    path: Arc<PathBuf>,
    options: StoreOptions,
}

impl Store {
    /// Open (creating if needed) the database at `path` and make sure the schema exists
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let store = Store {
            path: Arc::new(path.as_ref().to_path_buf()),
            options,
        };

        let conn = store.connect()?;
        setup_database(&conn)?;
        debug!(path = %store.path.display(), "store opened");

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Fresh connection with per-connection settings applied
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(self.path.as_path())?;
        conn.busy_timeout(self.options.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `op` inside one IMMEDIATE transaction, retrying transient faults.
    ///
    /// `op` may run more than once, so it must not have effects outside `tx`.
    pub fn write<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        self.with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run a read-only query on a fresh connection, retrying transient faults
    pub fn read<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        self.with_retry(|| {
            let conn = self.connect()?;
            op(&conn)
        })
    }

    fn with_retry<T, F>(&self, mut attempt_once: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match attempt_once() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %err, "giving up on storage operation");
                        return Err(ExchangeError::StorageUnavailable { attempts: attempt });
                    }
                    warn!(attempt, error = %err, "transient storage fault, retrying");
                    thread::sleep(self.options.backoff * attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL UNIQUE,
            listing_id TEXT NOT NULL,
            buyer_id TEXT NOT NULL,
            seller_id TEXT NOT NULL,
            party_a TEXT NOT NULL,
            party_b TEXT NOT NULL,
            state TEXT NOT NULL,
            a_marked_at TEXT,
            b_marked_at TEXT,
            completed_at TEXT,
            dispute_raised_by TEXT,
            dispute_reason TEXT,
            dispute_raised_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (buyer_id <> seller_id),
            CHECK (party_a < party_b),
            CHECK ((state = 'completed') = (completed_at IS NOT NULL)),
            CHECK ((state = 'disputed') = (dispute_raised_by IS NOT NULL))
        );

        CREATE TABLE IF NOT EXISTS dispute_ledger (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            transaction_id TEXT NOT NULL REFERENCES transactions(id),
            raised_by TEXT NOT NULL,
            reason TEXT NOT NULL,
            prior_state TEXT NOT NULL,
            raised_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rating_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            transaction_id TEXT NOT NULL REFERENCES transactions(id),
            rater_id TEXT NOT NULL,
            rated_user_id TEXT NOT NULL,
            score INTEGER NOT NULL CHECK (score BETWEEN 1 AND 5),
            role TEXT NOT NULL,
            comment TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (transaction_id, rater_id)
        );

        -- Derived cache, rebuildable from rating_events
        CREATE TABLE IF NOT EXISTS rating_summaries (
            user_id TEXT PRIMARY KEY,
            overall_average REAL NOT NULL DEFAULT 0,
            overall_count INTEGER NOT NULL DEFAULT 0,
            seller_average REAL NOT NULL DEFAULT 0,
            seller_count INTEGER NOT NULL DEFAULT 0,
            buyer_average REAL NOT NULL DEFAULT 0,
            buyer_count INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        -- Outbox for the notification emitter
        CREATE TABLE IF NOT EXISTS notifications (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            event_type TEXT NOT NULL,
            transaction_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            dispatched_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_buyer ON transactions(buyer_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_seller ON transactions(seller_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_state ON transactions(state);
        CREATE INDEX IF NOT EXISTS idx_dispute_ledger_tx ON dispute_ledger(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_rating_events_rated ON rating_events(rated_user_id, seq);
        CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(dispatched_at, seq);",
    )?;

    Ok(())
}

// ============================================================================
// TIME HELPERS
// ============================================================================

/// Current time at the precision the store keeps, so values read back compare equal
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 column value; `idx` is the column index for error reporting
pub fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn parse_optional_timestamp(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

/// True when `err` is a UNIQUE / PRIMARY KEY violation
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

// ============================================================================
// TESTS
// ============================================================================
