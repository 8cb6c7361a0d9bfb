// Dispute Ledger
//
// Append-only history of every disagree() that took effect. Entries are
// written in the same SQL transaction that moves a transaction to
// `disputed`. Resolution (re-opening, forcing completion, banning a party)
// belongs to the admin workflow, which reads from here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::db::{self, Store};
use crate::error::{ExchangeError, Result};
use crate::transaction::{self, Transaction, TransactionState};

pub const MAX_REASON_LEN: usize = 1000;

/// Trimmed reason, or Validation if empty or too long
pub fn validate_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();

    if reason.is_empty() {
        return Err(ExchangeError::Validation(
            "a dispute needs a reason".to_string(),
        ));
    }
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(ExchangeError::Validation(format!(
            "dispute reason is limited to {} characters",
            MAX_REASON_LEN
        )));
    }

    Ok(reason.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeEntry {
    pub id: String,
    pub transaction_id: String,
    pub raised_by: String,
    pub reason: String,
    /// State the transaction was in when the dispute was raised
    pub prior_state: TransactionState,
    pub raised_at: DateTime<Utc>,
}

/// A disputed transaction as the admin workflow sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputedTransaction {
    pub transaction: Transaction,
    pub entry: DisputeEntry,
}

/// Record the dispute `transaction` now carries; part of the caller's SQL transaction
pub(crate) fn append_entry(
    conn: &Connection,
    transaction: &Transaction,
    prior_state: TransactionState,
) -> Result<DisputeEntry> {
    let dispute = transaction.dispute.as_ref().ok_or_else(|| ExchangeError::InvalidState {
        transaction_id: transaction.id.clone(),
        reason: "no dispute recorded on transaction".to_string(),
    })?;

    let entry = DisputeEntry {
        id: uuid::Uuid::new_v4().to_string(),
        transaction_id: transaction.id.clone(),
        raised_by: dispute.raised_by.clone(),
        reason: dispute.reason.clone(),
        prior_state,
        raised_at: dispute.raised_at,
    };

    conn.execute(
        "INSERT INTO dispute_ledger (
            entry_id, transaction_id, raised_by, reason, prior_state, raised_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.transaction_id,
            entry.raised_by,
            entry.reason,
            entry.prior_state.as_str(),
            db::format_timestamp(&entry.raised_at),
        ],
    )?;

    Ok(entry)
}

fn entry_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<DisputeEntry> {
    let state_raw: String = row.get(offset + 4)?;
    let raised_raw: String = row.get(offset + 5)?;

    Ok(DisputeEntry {
        id: row.get(offset)?,
        transaction_id: row.get(offset + 1)?,
        raised_by: row.get(offset + 2)?,
        reason: row.get(offset + 3)?,
        prior_state: TransactionState::parse(&state_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                offset + 4,
                rusqlite::types::Type::Text,
                format!("unknown transaction state: {}", state_raw).into(),
            )
        })?,
        raised_at: db::parse_timestamp(offset + 5, &raised_raw)?,
    })
}

const ENTRY_COLUMNS: &str = "d.entry_id, d.transaction_id, d.raised_by, d.reason, d.prior_state, d.raised_at";
const TRANSACTION_COLUMNS: &str = "t.id, t.thread_id, t.listing_id, t.buyer_id, t.seller_id,
    t.party_a, t.party_b, t.state, t.a_marked_at, t.b_marked_at, t.completed_at,
    t.dispute_raised_by, t.dispute_reason, t.dispute_raised_at, t.version, t.created_at, t.updated_at";
const TRANSACTION_COLUMN_COUNT: usize = 17;

/// Read interface for the admin-resolution workflow
#[derive(Debug, Clone)]
pub struct DisputeLedger {
    store: Store,
}

impl DisputeLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Every transaction currently `disputed`, with the entry that put it there, oldest first
    pub fn list_disputed(&self) -> Result<Vec<DisputedTransaction>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {}, {}
                 FROM transactions t
                 JOIN dispute_ledger d ON d.transaction_id = t.id
                 WHERE t.state = 'disputed'
                 ORDER BY d.raised_at, d.seq",
                TRANSACTION_COLUMNS, ENTRY_COLUMNS
            ))?;

            let disputed = stmt
                .query_map([], |row| {
                    Ok(DisputedTransaction {
                        transaction: transaction::transaction_from_row(row)?,
                        entry: entry_from_row(row, TRANSACTION_COLUMN_COUNT)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(disputed)
        })
    }

    /// Full ledger history for one transaction, oldest first
    pub fn entries_for(&self, transaction_id: &str) -> Result<Vec<DisputeEntry>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM dispute_ledger d WHERE d.transaction_id = ?1 ORDER BY d.seq",
                ENTRY_COLUMNS
            ))?;

            let entries = stmt
                .query_map([transaction_id], |row| entry_from_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn count(&self) -> Result<i64> {
        self.store.read(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM dispute_ledger", [], |row| row.get(0))?)
        })
    }
}
