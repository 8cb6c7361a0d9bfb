// Transaction State Machine
//
//   open ──mark(x)──▶ pending_<other> ──mark/agree(other)──▶ completed
//     │                     │
//     └──────disagree───────┴──────────▶ disputed
//
// A transaction is scoped 1:1 to a message thread. The two parties are kept
// as an ordered pair {party_a, party_b} (lexicographic by user id), so the
// transition rules only ever reason about "this actor" and "the other actor";
// buyer/seller roles matter to ratings, not to completion.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{self, Store};
use crate::dispute;
use crate::error::{ExchangeError, Result};
use crate::notify::{self, NotificationEvent, Outbox};
use crate::thread::ThreadStore;

// ============================================================================
// PARTIES & ROLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    A,
    B,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::A => Party::B,
            Party::B => Party::A,
        }
    }
}

/// Marketplace role of a participant in one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    Seller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "buyer" => Some(Role::Buyer),
            "seller" => Some(Role::Seller),
            _ => None,
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Buyer => Role::Seller,
            Role::Seller => Role::Buyer,
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    /// Waiting on party A
    PendingA,
    /// Waiting on party B
    PendingB,
    Completed,
    Disputed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Open => "open",
            TransactionState::PendingA => "pending_a",
            TransactionState::PendingB => "pending_b",
            TransactionState::Completed => "completed",
            TransactionState::Disputed => "disputed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(TransactionState::Open),
            "pending_a" => Some(TransactionState::PendingA),
            "pending_b" => Some(TransactionState::PendingB),
            "completed" => Some(TransactionState::Completed),
            "disputed" => Some(TransactionState::Disputed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Disputed
        )
    }

    /// The pending state that waits on `party`
    pub fn pending_on(party: Party) -> Self {
        match party {
            Party::A => TransactionState::PendingA,
            Party::B => TransactionState::PendingB,
        }
    }

    pub fn waiting_on(&self) -> Option<Party> {
        match self {
            TransactionState::PendingA => Some(Party::A),
            TransactionState::PendingB => Some(Party::B),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub raised_by: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// What the offer workflow hands over when a seller accepts an offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub thread_id: String,
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub thread_id: String,
    pub listing_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub party_a: String,
    pub party_b: String,
    pub state: TransactionState,
    pub a_marked_at: Option<DateTime<Utc>>,
    pub b_marked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dispute: Option<Dispute>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A state change produced by a command
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TransactionState,
    pub to: TransactionState,
    pub actor_id: String,
    /// Counterparty of the actor; the only one notified
    pub recipient_id: String,
}

impl Transaction {
    /// Build a fresh `open` transaction, assigning the a/b ordering once
    pub fn new(new: NewTransaction, at: DateTime<Utc>) -> Result<Self> {
        for (field, value) in [
            ("thread_id", &new.thread_id),
            ("listing_id", &new.listing_id),
            ("buyer_id", &new.buyer_id),
            ("seller_id", &new.seller_id),
        ] {
            if value.trim().is_empty() {
                return Err(ExchangeError::Validation(format!("{} must not be empty", field)));
            }
        }
        if new.buyer_id == new.seller_id {
            return Err(ExchangeError::Validation(
                "buyer and seller must be different users".to_string(),
            ));
        }

        let (party_a, party_b) = if new.buyer_id < new.seller_id {
            (new.buyer_id.clone(), new.seller_id.clone())
        } else {
            (new.seller_id.clone(), new.buyer_id.clone())
        };

        Ok(Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: new.thread_id,
            listing_id: new.listing_id,
            buyer_id: new.buyer_id,
            seller_id: new.seller_id,
            party_a,
            party_b,
            state: TransactionState::Open,
            a_marked_at: None,
            b_marked_at: None,
            completed_at: None,
            dispute: None,
            version: 1,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn party_of(&self, user_id: &str) -> Option<Party> {
        if user_id == self.party_a {
            Some(Party::A)
        } else if user_id == self.party_b {
            Some(Party::B)
        } else {
            None
        }
    }

    pub fn user_of(&self, party: Party) -> &str {
        match party {
            Party::A => &self.party_a,
            Party::B => &self.party_b,
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if user_id == self.buyer_id {
            Some(Role::Buyer)
        } else if user_id == self.seller_id {
            Some(Role::Seller)
        } else {
            None
        }
    }

    pub fn counterparty_of(&self, user_id: &str) -> Option<&str> {
        self.party_of(user_id).map(|p| self.user_of(p.other()))
    }

    pub fn marked_at(&self, party: Party) -> Option<DateTime<Utc>> {
        match party {
            Party::A => self.a_marked_at,
            Party::B => self.b_marked_at,
        }
    }

    pub fn matches_request(&self, new: &NewTransaction) -> bool {
        self.thread_id == new.thread_id
            && self.listing_id == new.listing_id
            && self.buyer_id == new.buyer_id
            && self.seller_id == new.seller_id
    }

    // ------------------------------------------------------------------------
    // Commands. Each returns the transition it made; None means no-op.
    // ------------------------------------------------------------------------

    /// Record `actor_id`'s claim that the exchange happened.
    ///
    /// Repeating it is a no-op in any state, so retried requests are harmless.
    pub fn mark_complete(&mut self, actor_id: &str, at: DateTime<Utc>) -> Result<Option<Transition>> {
        let party = self.require_party(actor_id)?;

        if self.marked_at(party).is_some() {
            return Ok(None);
        }
        if self.state.is_terminal() {
            return Err(self.terminal_error());
        }

        Ok(Some(self.record_mark(party, at)))
    }

    /// Confirm the other side's claim. Only the party being waited on may agree.
    pub fn agree(&mut self, actor_id: &str, at: DateTime<Utc>) -> Result<Transition> {
        let party = self.require_party(actor_id)?;

        if self.state.is_terminal() {
            return Err(self.terminal_error());
        }
        if self.state.waiting_on() != Some(party) {
            let reason = match self.state.waiting_on() {
                Some(_) => "you already marked this complete, waiting on the other party".to_string(),
                None => "nothing to agree to, the other party has not marked this complete".to_string(),
            };
            return Err(ExchangeError::InvalidState {
                transaction_id: self.id.clone(),
                reason,
            });
        }

        Ok(self.record_mark(party, at))
    }

    /// Halt completion and hand the transaction to human resolution
    pub fn disagree(&mut self, actor_id: &str, reason: &str, at: DateTime<Utc>) -> Result<Transition> {
        let reason = dispute::validate_reason(reason)?;
        let party = self.require_party(actor_id)?;

        if self.state.is_terminal() {
            return Err(self.terminal_error());
        }

        let from = self.state;
        self.state = TransactionState::Disputed;
        self.dispute = Some(Dispute {
            raised_by: actor_id.to_string(),
            reason,
            raised_at: at,
        });

        Ok(Transition {
            from,
            to: TransactionState::Disputed,
            actor_id: actor_id.to_string(),
            recipient_id: self.user_of(party.other()).to_string(),
        })
    }

    fn record_mark(&mut self, party: Party, at: DateTime<Utc>) -> Transition {
        let from = self.state;

        match party {
            Party::A => self.a_marked_at = Some(at),
            Party::B => self.b_marked_at = Some(at),
        }

        if self.marked_at(party.other()).is_some() {
            self.state = TransactionState::Completed;
            self.completed_at = Some(at);
        } else {
            self.state = TransactionState::pending_on(party.other());
        }

        Transition {
            from,
            to: self.state,
            actor_id: self.user_of(party).to_string(),
            recipient_id: self.user_of(party.other()).to_string(),
        }
    }

    fn require_party(&self, actor_id: &str) -> Result<Party> {
        self.party_of(actor_id)
            .ok_or_else(|| ExchangeError::NotParticipant {
                transaction_id: self.id.clone(),
                actor_id: actor_id.to_string(),
            })
    }

    fn terminal_error(&self) -> ExchangeError {
        ExchangeError::TerminalState {
            transaction_id: self.id.clone(),
            state: self.state.to_string(),
        }
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const COLUMNS: &str = "id, thread_id, listing_id, buyer_id, seller_id, party_a, party_b, state,
    a_marked_at, b_marked_at, completed_at, dispute_raised_by, dispute_reason, dispute_raised_at,
    version, created_at, updated_at";

pub(crate) fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let state_raw: String = row.get(7)?;
    let state = TransactionState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown transaction state: {}", state_raw).into(),
        )
    })?;

    let dispute_raised_by: Option<String> = row.get(11)?;
    let dispute_reason: Option<String> = row.get(12)?;
    let dispute_raised_at = db::parse_optional_timestamp(13, row.get(13)?)?;
    let dispute = match (dispute_raised_by, dispute_reason, dispute_raised_at) {
        (Some(raised_by), Some(reason), Some(raised_at)) => Some(Dispute {
            raised_by,
            reason,
            raised_at,
        }),
        _ => None,
    };

    let created_raw: String = row.get(15)?;
    let updated_raw: String = row.get(16)?;

    Ok(Transaction {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        listing_id: row.get(2)?,
        buyer_id: row.get(3)?,
        seller_id: row.get(4)?,
        party_a: row.get(5)?,
        party_b: row.get(6)?,
        state,
        a_marked_at: db::parse_optional_timestamp(8, row.get(8)?)?,
        b_marked_at: db::parse_optional_timestamp(9, row.get(9)?)?,
        completed_at: db::parse_optional_timestamp(10, row.get(10)?)?,
        dispute,
        version: row.get(14)?,
        created_at: db::parse_timestamp(15, &created_raw)?,
        updated_at: db::parse_timestamp(16, &updated_raw)?,
    })
}

pub(crate) fn load_transaction(conn: &Connection, id: &str) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, [id], transaction_from_row).optional()?)
}

fn load_by_thread(conn: &Connection, thread_id: &str) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions WHERE thread_id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, [thread_id], transaction_from_row).optional()?)
}

fn insert_transaction(conn: &Connection, tx: &Transaction) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO transactions ({}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL, NULL, NULL, NULL, ?9, ?10, ?11)",
            COLUMNS
        ),
        params![
            tx.id,
            tx.thread_id,
            tx.listing_id,
            tx.buyer_id,
            tx.seller_id,
            tx.party_a,
            tx.party_b,
            tx.state.as_str(),
            tx.version,
            db::format_timestamp(&tx.created_at),
            db::format_timestamp(&tx.updated_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        // Another writer linked the thread first; the retry will find it
        Err(err) if db::is_unique_violation(&err) => Err(ExchangeError::Conflict {
            entity: "thread",
            id: tx.thread_id.clone(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Write back the mutable columns, compare-and-swap on `expected_version`
fn update_transaction(conn: &Connection, tx: &Transaction, expected_version: i64) -> Result<()> {
    let dispute = tx.dispute.as_ref();

    let changed = conn.execute(
        "UPDATE transactions SET
            state = ?1,
            a_marked_at = ?2,
            b_marked_at = ?3,
            completed_at = ?4,
            dispute_raised_by = ?5,
            dispute_reason = ?6,
            dispute_raised_at = ?7,
            version = ?8,
            updated_at = ?9
         WHERE id = ?10 AND version = ?11",
        params![
            tx.state.as_str(),
            tx.a_marked_at.as_ref().map(db::format_timestamp),
            tx.b_marked_at.as_ref().map(db::format_timestamp),
            tx.completed_at.as_ref().map(db::format_timestamp),
            dispute.map(|d| d.raised_by.as_str()),
            dispute.map(|d| d.reason.as_str()),
            dispute.map(|d| db::format_timestamp(&d.raised_at)),
            tx.version,
            db::format_timestamp(&tx.updated_at),
            tx.id,
            expected_version,
        ],
    )?;

    if changed == 0 {
        return Err(ExchangeError::Conflict {
            entity: "transaction",
            id: tx.id.clone(),
        });
    }
    Ok(())
}

// ============================================================================
// ENGINE
// ============================================================================

/// Command surface over stored transactions.
///
/// Each command is one atomic read-modify-write; its notification is
/// committed with it and handed to the emitter afterwards.
#[derive(Clone)]
pub struct TransactionEngine {
    store: Store,
    outbox: Outbox,
    threads: Option<Arc<dyn ThreadStore>>,
}

impl TransactionEngine {
    pub fn new(store: Store, outbox: Outbox) -> Self {
        Self {
            store,
            outbox,
            threads: None,
        }
    }

    /// Check thread linkage against the Thread Store when opening transactions
    pub fn with_thread_store(mut self, threads: Arc<dyn ThreadStore>) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Called by the offer workflow when a seller accepts an offer.
    ///
    /// Replaying the same acceptance returns the transaction already linked
    /// to the thread.
    pub fn open_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        // Validates ids before touching any collaborator
        Transaction::new(new.clone(), db::now())?;

        if let Some(threads) = &self.threads {
            let thread = threads
                .thread(&new.thread_id)?
                .ok_or_else(|| ExchangeError::not_found("thread", new.thread_id.clone()))?;

            if thread.listing_id != new.listing_id {
                return Err(ExchangeError::Validation(format!(
                    "thread {} is about listing {}, not {}",
                    thread.thread_id, thread.listing_id, new.listing_id
                )));
            }
            for user in [&new.buyer_id, &new.seller_id] {
                if !thread.has_participant(user) {
                    return Err(ExchangeError::Validation(format!(
                        "user {} is not in thread {}",
                        user, thread.thread_id
                    )));
                }
            }
        }

        let transaction = self.store.write(|conn| {
            if let Some(existing) = load_by_thread(conn, &new.thread_id)? {
                if existing.matches_request(&new) {
                    return Ok(existing);
                }
                return Err(ExchangeError::Validation(format!(
                    "thread {} is already linked to transaction {}",
                    new.thread_id, existing.id
                )));
            }

            let transaction = Transaction::new(new.clone(), db::now())?;
            insert_transaction(conn, &transaction)?;
            Ok(transaction)
        })?;

        info!(
            transaction_id = %transaction.id,
            thread_id = %transaction.thread_id,
            "transaction opened"
        );
        Ok(transaction)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<Transaction> {
        self.store.read(|conn| {
            load_transaction(conn, transaction_id)?
                .ok_or_else(|| ExchangeError::not_found("transaction", transaction_id))
        })
    }

    /// Transactions where `user_id` is buyer or seller, newest first
    pub fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transactions
                 WHERE buyer_id = ?1 OR seller_id = ?1
                 ORDER BY created_at DESC, id",
                COLUMNS
            ))?;
            let transactions = stmt
                .query_map([user_id], transaction_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(transactions)
        })
    }

    pub fn mark_complete(&self, transaction_id: &str, actor_id: &str) -> Result<Transaction> {
        self.execute(transaction_id, actor_id, "mark_complete", |record, at| {
            record.mark_complete(actor_id, at)
        })
    }

    pub fn agree(&self, transaction_id: &str, actor_id: &str) -> Result<Transaction> {
        self.execute(transaction_id, actor_id, "agree", |record, at| {
            record.agree(actor_id, at).map(Some)
        })
    }

    pub fn disagree(&self, transaction_id: &str, actor_id: &str, reason: &str) -> Result<Transaction> {
        let reason = dispute::validate_reason(reason)?;

        self.execute(transaction_id, actor_id, "disagree", |record, at| {
            record.disagree(actor_id, &reason, at).map(Some)
        })
    }

    fn execute<F>(
        &self,
        transaction_id: &str,
        actor_id: &str,
        command: &'static str,
        apply: F,
    ) -> Result<Transaction>
    where
        F: Fn(&mut Transaction, DateTime<Utc>) -> Result<Option<Transition>>,
    {
        let result = self.store.write(|conn| {
            let mut record = load_transaction(conn, transaction_id)?
                .ok_or_else(|| ExchangeError::not_found("transaction", transaction_id))?;
            let expected_version = record.version;
            let now = db::now();

            let Some(transition) = apply(&mut record, now)? else {
                return Ok((record, None));
            };

            record.version += 1;
            record.updated_at = now;
            update_transaction(conn, &record, expected_version)?;

            if transition.to == TransactionState::Disputed {
                dispute::append_entry(conn, &record, transition.from)?;
            }

            let event = NotificationEvent::for_transition(
                &record,
                &transition.actor_id,
                &transition.recipient_id,
                now,
            );
            if let Some(event) = &event {
                notify::enqueue(conn, event)?;
            }

            Ok((record, Some((transition, event))))
        });

        let (record, outcome) = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(transaction_id, actor_id, command, kind = err.kind(), error = %err, "command rejected");
                return Err(err);
            }
        };

        match outcome {
            None => {
                debug!(transaction_id, actor_id, command, state = %record.state, "no-op, already marked");
            }
            Some((transition, event)) => {
                info!(
                    transaction_id,
                    actor_id,
                    command,
                    from = %transition.from,
                    to = %transition.to,
                    "transaction transition"
                );
                if let Some(event) = event {
                    self.outbox.dispatch(&event);
                }
            }
        }

        Ok(record)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_store;
    use crate::notify::{NotificationType, RecordingEmitter};
    use crate::thread::{InMemoryThreadStore, ThreadInfo};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    const BUYER: &str = "u-buyer";
    const SELLER: &str = "u-seller";
    const STRANGER: &str = "u-stranger";

    fn new_request(thread_id: &str) -> NewTransaction {
        NewTransaction {
            thread_id: thread_id.to_string(),
            listing_id: "lst-1".to_string(),
            buyer_id: BUYER.to_string(),
            seller_id: SELLER.to_string(),
        }
    }

    fn fresh() -> Transaction {
        Transaction::new(new_request("th-1"), db::now()).unwrap()
    }

    fn engine() -> (TempDir, TransactionEngine, Arc<RecordingEmitter>, Outbox) {
        let (dir, store) = test_store();
        let emitter = Arc::new(RecordingEmitter::new());
        let outbox = Outbox::new(store.clone(), emitter.clone());
        (dir, TransactionEngine::new(store, outbox.clone()), emitter, outbox)
    }

    // ------------------------------------------------------------------------
    // Pure transitions
    // ------------------------------------------------------------------------

    #[test]
    fn test_party_ordering_is_lexicographic() {
        let tx = fresh();
        assert_eq!(tx.party_a, BUYER);
        assert_eq!(tx.party_b, SELLER);

        let mut reversed = new_request("th-2");
        reversed.buyer_id = "zed".to_string();
        reversed.seller_id = "amy".to_string();
        let tx = Transaction::new(reversed, db::now()).unwrap();
        assert_eq!(tx.party_a, "amy");
        assert_eq!(tx.party_b, "zed");
        assert_eq!(tx.role_of("amy"), Some(Role::Seller));
        assert_eq!(tx.counterparty_of("amy"), Some("zed"));
    }

    #[test]
    fn test_new_transaction_validation() {
        let mut same = new_request("th-1");
        same.seller_id = BUYER.to_string();
        assert!(matches!(
            Transaction::new(same, db::now()),
            Err(ExchangeError::Validation(_))
        ));

        let mut blank = new_request("th-1");
        blank.listing_id = "  ".to_string();
        assert!(matches!(
            Transaction::new(blank, db::now()),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_first_mark_waits_on_other_party() {
        let mut tx = fresh();
        let transition = tx.mark_complete(SELLER, db::now()).unwrap().unwrap();

        assert_eq!(tx.state, TransactionState::PendingA);
        assert!(tx.b_marked_at.is_some());
        assert!(tx.a_marked_at.is_none());
        assert_eq!(transition.from, TransactionState::Open);
        assert_eq!(transition.recipient_id, BUYER);
    }

    #[test]
    fn test_second_mark_completes() {
        let mut tx = fresh();
        tx.mark_complete(BUYER, db::now()).unwrap();
        let transition = tx.mark_complete(SELLER, db::now()).unwrap().unwrap();

        assert_eq!(tx.state, TransactionState::Completed);
        assert!(tx.completed_at.is_some());
        assert_eq!(transition.to, TransactionState::Completed);
        assert_eq!(transition.recipient_id, BUYER);
    }

    #[test]
    fn test_mark_complete_is_idempotent() {
        let mut tx = fresh();
        tx.mark_complete(BUYER, db::now()).unwrap();
        let snapshot = tx.clone();

        assert!(tx.mark_complete(BUYER, db::now()).unwrap().is_none());
        assert_eq!(tx, snapshot);

        // Still a no-op once completed
        tx.mark_complete(SELLER, db::now()).unwrap();
        let completed = tx.clone();
        assert!(tx.mark_complete(BUYER, db::now()).unwrap().is_none());
        assert!(tx.mark_complete(SELLER, db::now()).unwrap().is_none());
        assert_eq!(tx, completed);
    }

    #[test]
    fn test_mark_after_dispute_is_terminal() {
        let mut tx = fresh();
        tx.disagree(SELLER, "never showed up", db::now()).unwrap();

        assert!(matches!(
            tx.mark_complete(BUYER, db::now()),
            Err(ExchangeError::TerminalState { .. })
        ));
    }

    #[test]
    fn test_agree_requires_being_waited_on() {
        let mut tx = fresh();
        assert!(matches!(
            tx.agree(SELLER, db::now()),
            Err(ExchangeError::InvalidState { .. })
        ));

        tx.mark_complete(BUYER, db::now()).unwrap();
        assert!(matches!(
            tx.agree(BUYER, db::now()),
            Err(ExchangeError::InvalidState { .. })
        ));

        let transition = tx.agree(SELLER, db::now()).unwrap();
        assert_eq!(transition.to, TransactionState::Completed);
        assert!(matches!(
            tx.agree(SELLER, db::now()),
            Err(ExchangeError::TerminalState { .. })
        ));
    }

    #[test]
    fn test_disagree_from_every_non_terminal_state() {
        let mut open = fresh();
        let mut pending_b = fresh();
        pending_b.mark_complete(BUYER, db::now()).unwrap();
        let mut pending_a = fresh();
        pending_a.mark_complete(SELLER, db::now()).unwrap();

        for (tx, from) in [
            (&mut open, TransactionState::Open),
            (&mut pending_b, TransactionState::PendingB),
            (&mut pending_a, TransactionState::PendingA),
        ] {
            let transition = tx.disagree(BUYER, "item not as described", db::now()).unwrap();
            assert_eq!(transition.from, from);
            assert_eq!(tx.state, TransactionState::Disputed);
            assert_eq!(tx.dispute.as_ref().unwrap().raised_by, BUYER);

            // Irreversible: nothing moves it back
            assert!(tx.disagree(SELLER, "again", db::now()).is_err());
            assert!(tx.agree(SELLER, db::now()).is_err());
            assert_eq!(tx.state, TransactionState::Disputed);
        }
    }

    #[test]
    fn test_disagree_requires_reason() {
        let mut tx = fresh();
        assert!(matches!(
            tx.disagree(BUYER, "   ", db::now()),
            Err(ExchangeError::Validation(_))
        ));
        assert_eq!(tx.state, TransactionState::Open);
    }

    #[test]
    fn test_strangers_are_rejected() {
        let mut tx = fresh();
        assert!(matches!(
            tx.mark_complete(STRANGER, db::now()),
            Err(ExchangeError::NotParticipant { .. })
        ));
        assert!(matches!(
            tx.agree(STRANGER, db::now()),
            Err(ExchangeError::NotParticipant { .. })
        ));
        assert!(matches!(
            tx.disagree(STRANGER, "spam", db::now()),
            Err(ExchangeError::NotParticipant { .. })
        ));
    }

    #[test]
    fn test_completed_iff_both_marked() {
        let orders: [[&str; 2]; 2] = [[BUYER, SELLER], [SELLER, BUYER]];
        for order in orders {
            let mut tx = fresh();
            for actor in order {
                tx.mark_complete(actor, db::now()).unwrap();
                let both = tx.a_marked_at.is_some() && tx.b_marked_at.is_some();
                assert_eq!(both, tx.state == TransactionState::Completed);
                assert_eq!(tx.completed_at.is_some(), tx.state == TransactionState::Completed);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------------

    #[test]
    fn test_engine_round_trip() {
        let (_dir, engine, emitter, outbox) = engine();
        let opened = engine.open_transaction(new_request("th-1")).unwrap();

        let marked = engine.mark_complete(&opened.id, BUYER).unwrap();
        assert_eq!(marked.state, TransactionState::PendingB);
        assert_eq!(marked.version, 2);
        assert_eq!(engine.get_transaction(&opened.id).unwrap(), marked);

        let events = emitter.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, NotificationType::TransactionPending);
        assert_eq!(events[0].recipient_id, SELLER);
        assert!(outbox.pending().unwrap().is_empty());
    }

    #[test]
    fn test_engine_no_op_emits_nothing() {
        let (_dir, engine, emitter, _outbox) = engine();
        let opened = engine.open_transaction(new_request("th-1")).unwrap();

        let first = engine.mark_complete(&opened.id, BUYER).unwrap();
        let second = engine.mark_complete(&opened.id, BUYER).unwrap();

        assert_eq!(first, second);
        assert_eq!(emitter.take().len(), 1);
    }

    #[test]
    fn test_engine_unknown_transaction() {
        let (_dir, engine, _emitter, _outbox) = engine();

        assert!(matches!(
            engine.mark_complete("missing", BUYER),
            Err(ExchangeError::NotFound { .. })
        ));
        assert!(matches!(
            engine.get_transaction("missing"),
            Err(ExchangeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_open_transaction_replay_and_conflict() {
        let (_dir, engine, _emitter, _outbox) = engine();

        let first = engine.open_transaction(new_request("th-1")).unwrap();
        let replay = engine.open_transaction(new_request("th-1")).unwrap();
        assert_eq!(first, replay);

        let mut other = new_request("th-1");
        other.buyer_id = "u-another".to_string();
        assert!(matches!(
            engine.open_transaction(other),
            Err(ExchangeError::Validation(_))
        ));
    }

    #[test]
    fn test_open_transaction_checks_thread_store() {
        let (_dir, engine, _emitter, _outbox) = engine();
        let threads = InMemoryThreadStore::new();
        threads.insert(ThreadInfo {
            thread_id: "th-1".to_string(),
            listing_id: "lst-1".to_string(),
            participants: vec![BUYER.to_string(), SELLER.to_string()],
        });
        let engine = engine.with_thread_store(Arc::new(threads));

        assert!(matches!(
            engine.open_transaction(new_request("th-404")),
            Err(ExchangeError::NotFound { .. })
        ));

        let mut wrong_listing = new_request("th-1");
        wrong_listing.listing_id = "lst-2".to_string();
        assert!(matches!(
            engine.open_transaction(wrong_listing),
            Err(ExchangeError::Validation(_))
        ));

        let mut outsider = new_request("th-1");
        outsider.buyer_id = STRANGER.to_string();
        assert!(matches!(
            engine.open_transaction(outsider),
            Err(ExchangeError::Validation(_))
        ));

        assert!(engine.open_transaction(new_request("th-1")).is_ok());
    }

    #[test]
    fn test_transactions_for_user() {
        let (_dir, engine, _emitter, _outbox) = engine();
        engine.open_transaction(new_request("th-1")).unwrap();
        engine.open_transaction(new_request("th-2")).unwrap();

        assert_eq!(engine.transactions_for_user(BUYER).unwrap().len(), 2);
        assert_eq!(engine.transactions_for_user(SELLER).unwrap().len(), 2);
        assert!(engine.transactions_for_user(STRANGER).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_marks_complete_exactly_once() {
        let (_dir, engine, _emitter, outbox) = engine();

        for round in 0..8 {
            let opened = engine
                .open_transaction(new_request(&format!("th-race-{}", round)))
                .unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = [BUYER, SELLER]
                .into_iter()
                .map(|actor| {
                    let engine = engine.clone();
                    let id = opened.id.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        engine.mark_complete(&id, actor)
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            let settled = engine.get_transaction(&opened.id).unwrap();
            assert_eq!(settled.state, TransactionState::Completed);
            assert!(settled.a_marked_at.is_some() && settled.b_marked_at.is_some());
            assert_eq!(settled.version, 3);

            let types: Vec<NotificationType> = outbox
                .events_for_transaction(&opened.id)
                .unwrap()
                .into_iter()
                .map(|e| e.event_type)
                .collect();
            assert_eq!(
                types,
                vec![
                    NotificationType::TransactionPending,
                    NotificationType::TransactionCompleted
                ]
            );
        }
    }

    #[test]
    fn test_concurrent_disagree_first_writer_wins() {
        let (_dir, engine, _emitter, _outbox) = engine();
        let opened = engine.open_transaction(new_request("th-1")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [BUYER, SELLER]
            .into_iter()
            .map(|actor| {
                let engine = engine.clone();
                let id = opened.id.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.disagree(&id, actor, "does not match the listing")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let terminal = results
            .iter()
            .filter(|r| matches!(r, Err(ExchangeError::TerminalState { .. })))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(terminal, 1);
    }
}
