// Error taxonomy for the exchange core
//
// Every business-rule rejection is a typed variant reported straight to the
// caller. Only storage faults are retried (see db::Store::write), and those
// collapse into StorageUnavailable after the last attempt.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("user {actor_id} is not a party to transaction {transaction_id}")]
    NotParticipant {
        transaction_id: String,
        actor_id: String,
    },

    #[error("transaction {transaction_id} is already {state}")]
    TerminalState {
        transaction_id: String,
        state: String,
    },

    #[error("invalid state for transaction {transaction_id}: {reason}")]
    InvalidState {
        transaction_id: String,
        reason: String,
    },

    #[error("user {rater_id} already rated transaction {transaction_id}")]
    DuplicateRating {
        transaction_id: String,
        rater_id: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage unavailable after {attempts} attempts")]
    StorageUnavailable { attempts: u32 },

    /// Compare-and-swap on a version column lost the race. Retried internally.
    #[error("concurrent update on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExchangeError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ExchangeError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable code, shown verbatim by the presentation layer.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::NotFound { .. } => "not_found",
            ExchangeError::NotParticipant { .. } => "not_participant",
            ExchangeError::TerminalState { .. } => "terminal_state",
            ExchangeError::InvalidState { .. } => "invalid_state",
            ExchangeError::DuplicateRating { .. } => "duplicate_rating",
            ExchangeError::Validation(_) => "validation",
            ExchangeError::StorageUnavailable { .. } => "storage_unavailable",
            ExchangeError::Conflict { .. } => "conflict",
            ExchangeError::Storage(_) => "storage",
            ExchangeError::Serialization(_) => "serialization",
        }
    }

    /// Lock contention and lost CAS races are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Conflict { .. } => true,
            ExchangeError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = ExchangeError::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let conflict = ExchangeError::Conflict {
            entity: "transaction",
            id: "t1".to_string(),
        };
        assert!(conflict.is_transient());
    }

    #[test]
    fn test_business_errors_are_not_retried() {
        let errors = vec![
            ExchangeError::not_found("transaction", "t1"),
            ExchangeError::Validation("score out of range".to_string()),
            ExchangeError::DuplicateRating {
                transaction_id: "t1".to_string(),
                rater_id: "u1".to_string(),
            },
            ExchangeError::Storage(rusqlite::Error::QueryReturnedNoRows),
        ];

        for err in errors {
            assert!(!err.is_transient(), "{} should not be transient", err.kind());
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ExchangeError::not_found("user", "u1").kind(), "not_found");
        assert_eq!(
            ExchangeError::StorageUnavailable { attempts: 3 }.to_string(),
            "storage unavailable after 3 attempts"
        );
    }
}
