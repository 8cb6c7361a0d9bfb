// Exchange - the core's public surface
//
// Bundles the state machine, the dispute ledger, the rating engine and the
// notification outbox over one store. Transport layers (HTTP, CLI) only
// talk to this.

use std::sync::Arc;

use crate::db::Store;
use crate::dispute::{DisputeEntry, DisputeLedger, DisputedTransaction};
use crate::error::Result;
use crate::notify::{NotificationEmitter, Outbox};
use crate::rating::{RatingEngine, RatingEvent, RatingSummary};
use crate::thread::ThreadStore;
use crate::transaction::{NewTransaction, Transaction, TransactionEngine};

#[derive(Clone)]
pub struct Exchange {
    transactions: TransactionEngine,
    disputes: DisputeLedger,
    ratings: RatingEngine,
    outbox: Outbox,
}

impl Exchange {
    pub fn new(store: Store, emitter: Arc<dyn NotificationEmitter>) -> Self {
        let outbox = Outbox::new(store.clone(), emitter);

        Self {
            transactions: TransactionEngine::new(store.clone(), outbox.clone()),
            disputes: DisputeLedger::new(store.clone()),
            ratings: RatingEngine::new(store),
            outbox,
        }
    }

    pub fn with_thread_store(mut self, threads: Arc<dyn ThreadStore>) -> Self {
        self.transactions = self.transactions.with_thread_store(threads);
        self
    }

    pub fn transactions(&self) -> &TransactionEngine {
        &self.transactions
    }

    pub fn disputes(&self) -> &DisputeLedger {
        &self.disputes
    }

    pub fn ratings(&self) -> &RatingEngine {
        &self.ratings
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    // ------------------------------------------------------------------------
    // RPC surface
    // ------------------------------------------------------------------------

    pub fn open_transaction(&self, new: NewTransaction) -> Result<Transaction> {
        self.transactions.open_transaction(new)
    }

    pub fn mark_complete(&self, transaction_id: &str, actor_id: &str) -> Result<Transaction> {
        self.transactions.mark_complete(transaction_id, actor_id)
    }

    pub fn agree(&self, transaction_id: &str, actor_id: &str) -> Result<Transaction> {
        self.transactions.agree(transaction_id, actor_id)
    }

    pub fn disagree(&self, transaction_id: &str, actor_id: &str, reason: &str) -> Result<Transaction> {
        self.transactions.disagree(transaction_id, actor_id, reason)
    }

    pub fn submit_rating(
        &self,
        transaction_id: &str,
        rater_id: &str,
        score: i64,
        comment: Option<&str>,
    ) -> Result<RatingSummary> {
        self.ratings.submit_rating(transaction_id, rater_id, score, comment)
    }

    pub fn get_summary(&self, user_id: &str) -> Result<RatingSummary> {
        self.ratings.get_summary(user_id)
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<Transaction> {
        self.transactions.get_transaction(transaction_id)
    }

    pub fn transactions_for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.transactions.transactions_for_user(user_id)
    }

    pub fn ratings_for_user(&self, user_id: &str) -> Result<Vec<RatingEvent>> {
        self.ratings.ratings_for_user(user_id)
    }

    pub fn list_disputed(&self) -> Result<Vec<DisputedTransaction>> {
        self.disputes.list_disputed()
    }

    pub fn dispute_entries(&self, transaction_id: &str) -> Result<Vec<DisputeEntry>> {
        self.disputes.entries_for(transaction_id)
    }
}
