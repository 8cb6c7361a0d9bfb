// Notification events and the outbox that hands them to the emitter
//
// The core never delivers anything. A transition writes its event into the
// notifications table inside the same SQL transaction, and after commit the
// event is handed to a NotificationEmitter. Events whose hand-off failed (or
// whose process died in between) stay undispatched until relay_pending().

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::db::{self, Store};
use crate::error::Result;
use crate::transaction::{Transaction, TransactionState};

// ============================================================================
// EVENT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "transaction.pending")]
    TransactionPending,
    #[serde(rename = "transaction.completed")]
    TransactionCompleted,
    #[serde(rename = "transaction.disputed")]
    TransactionDisputed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::TransactionPending => "transaction.pending",
            NotificationType::TransactionCompleted => "transaction.completed",
            NotificationType::TransactionDisputed => "transaction.disputed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "transaction.pending" => Some(NotificationType::TransactionPending),
            "transaction.completed" => Some(NotificationType::TransactionCompleted),
            "transaction.disputed" => Some(NotificationType::TransactionDisputed),
            _ => None,
        }
    }

    /// Event named for the state a transition lands in (Open is never a target)
    pub fn for_state(state: TransactionState) -> Option<Self> {
        match state {
            TransactionState::Open => None,
            TransactionState::PendingA | TransactionState::PendingB => {
                Some(NotificationType::TransactionPending)
            }
            TransactionState::Completed => Some(NotificationType::TransactionCompleted),
            TransactionState::Disputed => Some(NotificationType::TransactionDisputed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: NotificationType,
    pub transaction_id: String,
    pub recipient_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Event for `transaction` having just moved into its current state because of `actor_id`.
    ///
    /// Always addressed to the actor's counterparty.
    pub fn for_transition(
        transaction: &Transaction,
        actor_id: &str,
        recipient_id: &str,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        let event_type = NotificationType::for_state(transaction.state)?;

        let mut payload = serde_json::json!({
            "state": transaction.state.as_str(),
            "actor_id": actor_id,
            "thread_id": transaction.thread_id,
            "listing_id": transaction.listing_id,
        });
        if let Some(dispute) = &transaction.dispute {
            payload["reason"] = serde_json::json!(dispute.reason);
        }

        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            transaction_id: transaction.id.clone(),
            recipient_id: recipient_id.to_string(),
            payload,
            created_at: at,
        })
    }
}

// ============================================================================
// EMITTERS
// ============================================================================

/// Delivery collaborator. Retry and fan-out beyond the hand-off are its job.
pub trait NotificationEmitter: Send + Sync {
    fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// Writes each event to the log; the default when no transport is wired up
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl NotificationEmitter for LogEmitter {
    fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        info!(
            event_type = event.event_type.as_str(),
            transaction_id = %event.transaction_id,
            recipient_id = %event.recipient_id,
            "notification emitted"
        );
        Ok(())
    }
}

/// Keeps every emitted event in memory
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl NotificationEmitter for RecordingEmitter {
    fn emit(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording emitter poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

/// Persist `event` as part of the caller's SQL transaction
pub(crate) fn enqueue(conn: &Connection, event: &NotificationEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications (
            event_id, event_type, transaction_id, recipient_id, payload, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.id,
            event.event_type.as_str(),
            event.transaction_id,
            event.recipient_id,
            serde_json::to_string(&event.payload)?,
            db::format_timestamp(&event.created_at),
        ],
    )?;
    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationEvent> {
    let type_raw: String = row.get(1)?;
    let payload_raw: String = row.get(4)?;
    let created_raw: String = row.get(5)?;

    Ok(NotificationEvent {
        id: row.get(0)?,
        event_type: NotificationType::parse(&type_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown notification type: {}", type_raw).into(),
            )
        })?,
        transaction_id: row.get(2)?,
        recipient_id: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: db::parse_timestamp(5, &created_raw)?,
    })
}

const EVENT_COLUMNS: &str =
    "event_id, event_type, transaction_id, recipient_id, payload, created_at";

#[derive(Clone)]
pub struct Outbox {
    store: Store,
    emitter: Arc<dyn NotificationEmitter>,
}

impl Outbox {
    pub fn new(store: Store, emitter: Arc<dyn NotificationEmitter>) -> Self {
        Self { store, emitter }
    }

    /// Hand a committed event to the emitter and mark it dispatched.
    ///
    /// Failures are logged, never returned: the transition already committed
    /// and the event stays in the outbox for relay_pending().
    pub fn dispatch(&self, event: &NotificationEvent) -> bool {
        if let Err(err) = self.emitter.emit(event) {
            warn!(event_id = %event.id, error = %err, "notification hand-off failed, left in outbox");
            return false;
        }

        match self.mark_dispatched(&event.id) {
            Ok(()) => true,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "could not mark notification dispatched");
                false
            }
        }
    }

    fn mark_dispatched(&self, event_id: &str) -> Result<()> {
        let at = db::format_timestamp(&db::now());
        self.store.write(|tx| {
            tx.execute(
                "UPDATE notifications SET dispatched_at = ?1
                 WHERE event_id = ?2 AND dispatched_at IS NULL",
                params![at, event_id],
            )?;
            Ok(())
        })
    }

    /// Events committed but not yet handed off, oldest first
    pub fn pending(&self) -> Result<Vec<NotificationEvent>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notifications WHERE dispatched_at IS NULL ORDER BY seq",
                EVENT_COLUMNS
            ))?;
            let events = stmt
                .query_map([], event_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    /// Re-hand every undispatched event; returns how many went through
    pub fn relay_pending(&self) -> Result<usize> {
        let pending = self.pending()?;
        let total = pending.len();
        let delivered = pending.iter().filter(|event| self.dispatch(event)).count();

        if total > 0 {
            info!(delivered, total, "relayed pending notifications");
        } else {
            debug!("no pending notifications");
        }
        Ok(delivered)
    }

    /// Every event recorded for a transaction, oldest first
    pub fn events_for_transaction(&self, transaction_id: &str) -> Result<Vec<NotificationEvent>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM notifications WHERE transaction_id = ?1 ORDER BY seq",
                EVENT_COLUMNS
            ))?;
            let events = stmt
                .query_map([transaction_id], event_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }
}
