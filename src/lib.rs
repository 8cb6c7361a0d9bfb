// Trust Exchange - Core Library
// Transaction completion, disputes and rating aggregation for a verified
// peer-to-peer marketplace. Exposes all modules for the CLI, API server, and tests.

pub mod config;
pub mod db;
pub mod dispute;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod rating;
pub mod thread;
pub mod transaction;

#[cfg(feature = "server")]
pub mod http;

// Re-export commonly used types
pub use config::Config;
pub use db::{setup_database, Store, StoreOptions};
pub use dispute::{DisputeEntry, DisputeLedger, DisputedTransaction};
pub use error::{ExchangeError, Result};
pub use exchange::Exchange;
pub use notify::{
    LogEmitter, NotificationEmitter, NotificationEvent, NotificationType, Outbox,
    RecordingEmitter,
};
pub use rating::{RatingEngine, RatingEvent, RatingSummary, SummaryDrift};
pub use thread::{InMemoryThreadStore, ThreadInfo, ThreadStore};
pub use transaction::{
    Dispute, NewTransaction, Party, Role, Transaction, TransactionEngine, TransactionState,
    Transition,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
