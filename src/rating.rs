// Rating Aggregation Engine
//
// rating_events is the source of truth; rating_summaries is a cache of it.
// submit_rating appends an event and folds it into the rated user's summary
// inside one IMMEDIATE transaction, so two completions racing on the same
// user cannot lose an update. Replay folds the same events in commit (seq)
// order with the same formula, so a healthy cache equals its replay exactly.
//
// Bucket rule: a rating describes the rated user's performance in *their*
// role. A buyer's rating lands in the seller's "as seller" bucket and vice
// versa.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, Store};
use crate::error::{ExchangeError, Result};
use crate::transaction::{self, Role, TransactionState};

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 5;
pub const MAX_COMMENT_LEN: usize = 1000;

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEvent {
    pub id: String,
    pub transaction_id: String,
    pub rater_id: String,
    pub rated_user_id: String,
    pub score: u8,
    /// Role the rater played in the transaction
    pub role: Role,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-user aggregate. A zero count means "new member", never "rated 0".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub user_id: String,
    pub overall_average: f64,
    pub overall_count: i64,
    pub seller_average: f64,
    pub seller_count: i64,
    pub buyer_average: f64,
    pub buyer_count: i64,
}

impl RatingSummary {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            overall_average: 0.0,
            overall_count: 0,
            seller_average: 0.0,
            seller_count: 0,
            buyer_average: 0.0,
            buyer_count: 0,
        }
    }

    pub fn is_new_member(&self) -> bool {
        self.overall_count == 0
    }

    /// Fold one score into the `bucket` the rated user played, and into overall
    pub fn fold(&mut self, bucket: Role, score: u8) {
        let (average, count) = match bucket {
            Role::Seller => (&mut self.seller_average, &mut self.seller_count),
            Role::Buyer => (&mut self.buyer_average, &mut self.buyer_count),
        };
        *average = running_average(*average, *count, score);
        *count += 1;

        self.overall_average = running_average(self.overall_average, self.overall_count, score);
        self.overall_count += 1;
    }

    /// Rebuild from raw events (any order of arrival; folded in the order given)
    pub fn replay<'a>(user_id: &str, events: impl IntoIterator<Item = &'a RatingEvent>) -> Self {
        let mut summary = Self::empty(user_id);
        for event in events {
            summary.fold(event.role.counterpart(), event.score);
        }
        summary
    }
}

fn running_average(average: f64, count: i64, score: u8) -> f64 {
    (average * count as f64 + f64::from(score)) / (count + 1) as f64
}

/// Cached and replayed summaries that disagree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryDrift {
    pub user_id: String,
    pub cached: RatingSummary,
    pub replayed: RatingSummary,
}

fn validate_score(score: i64) -> Result<u8> {
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(ExchangeError::Validation(format!(
            "score must be between {} and {}, got {}",
            MIN_SCORE, MAX_SCORE, score
        )));
    }
    Ok(score as u8)
}

/// Trimmed comment; blank becomes None
fn validate_comment(comment: Option<&str>) -> Result<Option<String>> {
    let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if comment.chars().count() > MAX_COMMENT_LEN {
        return Err(ExchangeError::Validation(format!(
            "comment is limited to {} characters",
            MAX_COMMENT_LEN
        )));
    }
    Ok(Some(comment.to_string()))
}

// ============================================================================
// PERSISTENCE
// ============================================================================

const EVENT_COLUMNS: &str =
    "id, transaction_id, rater_id, rated_user_id, score, role, comment, created_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<RatingEvent> {
    let role_raw: String = row.get(5)?;
    let created_raw: String = row.get(7)?;

    Ok(RatingEvent {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        rater_id: row.get(2)?,
        rated_user_id: row.get(3)?,
        score: row.get(4)?,
        role: Role::parse(&role_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown role: {}", role_raw).into(),
            )
        })?,
        comment: row.get(6)?,
        created_at: db::parse_timestamp(7, &created_raw)?,
    })
}

fn insert_event(conn: &Connection, event: &RatingEvent) -> Result<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO rating_events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            EVENT_COLUMNS
        ),
        params![
            event.id,
            event.transaction_id,
            event.rater_id,
            event.rated_user_id,
            event.score,
            event.role.as_str(),
            event.comment,
            db::format_timestamp(&event.created_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(err) if db::is_unique_violation(&err) => Err(ExchangeError::DuplicateRating {
            transaction_id: event.transaction_id.clone(),
            rater_id: event.rater_id.clone(),
        }),
        Err(err) => Err(err.into()),
    }
}

fn events_for_user(conn: &Connection, user_id: &str) -> Result<Vec<RatingEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rating_events WHERE rated_user_id = ?1 ORDER BY seq",
        EVENT_COLUMNS
    ))?;
    let events = stmt
        .query_map([user_id], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Cached summary plus its CAS version; None if the user has no cache row
fn load_summary(conn: &Connection, user_id: &str) -> Result<Option<(RatingSummary, i64)>> {
    let row = conn
        .query_row(
            "SELECT user_id, overall_average, overall_count, seller_average, seller_count,
                    buyer_average, buyer_count, version
             FROM rating_summaries WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok((
                    RatingSummary {
                        user_id: row.get(0)?,
                        overall_average: row.get(1)?,
                        overall_count: row.get(2)?,
                        seller_average: row.get(3)?,
                        seller_count: row.get(4)?,
                        buyer_average: row.get(5)?,
                        buyer_count: row.get(6)?,
                    },
                    row.get(7)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

/// Insert or compare-and-swap the cache row
fn save_summary(conn: &Connection, summary: &RatingSummary, expected_version: Option<i64>) -> Result<()> {
    let now = db::format_timestamp(&db::now());

    let changed = match expected_version {
        None => conn.execute(
            "INSERT OR IGNORE INTO rating_summaries (
                user_id, overall_average, overall_count, seller_average, seller_count,
                buyer_average, buyer_count, version, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                summary.user_id,
                summary.overall_average,
                summary.overall_count,
                summary.seller_average,
                summary.seller_count,
                summary.buyer_average,
                summary.buyer_count,
                now,
            ],
        )?,
        Some(version) => conn.execute(
            "UPDATE rating_summaries SET
                overall_average = ?2, overall_count = ?3,
                seller_average = ?4, seller_count = ?5,
                buyer_average = ?6, buyer_count = ?7,
                version = version + 1, updated_at = ?8
             WHERE user_id = ?1 AND version = ?9",
            params![
                summary.user_id,
                summary.overall_average,
                summary.overall_count,
                summary.seller_average,
                summary.seller_count,
                summary.buyer_average,
                summary.buyer_count,
                now,
                version,
            ],
        )?,
    };

    if changed == 0 {
        return Err(ExchangeError::Conflict {
            entity: "rating_summary",
            id: summary.user_id.clone(),
        });
    }
    Ok(())
}

// ============================================================================
// ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct RatingEngine {
    store: Store,
}

impl RatingEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record `rater_id`'s score for their counterparty on a completed
    /// transaction. Returns the rated user's updated summary.
    pub fn submit_rating(
        &self,
        transaction_id: &str,
        rater_id: &str,
        score: i64,
        comment: Option<&str>,
    ) -> Result<RatingSummary> {
        let score = validate_score(score)?;
        let comment = validate_comment(comment)?;

        let result = self.store.write(|conn| {
            let record = transaction::load_transaction(conn, transaction_id)?
                .ok_or_else(|| ExchangeError::not_found("transaction", transaction_id))?;

            let role = record.role_of(rater_id).ok_or_else(|| ExchangeError::NotParticipant {
                transaction_id: transaction_id.to_string(),
                actor_id: rater_id.to_string(),
            })?;
            if record.state != TransactionState::Completed {
                return Err(ExchangeError::InvalidState {
                    transaction_id: transaction_id.to_string(),
                    reason: format!("ratings open once the transaction is completed, it is {}", record.state),
                });
            }
            let rated_user_id = match role {
                Role::Buyer => record.seller_id.clone(),
                Role::Seller => record.buyer_id.clone(),
            };

            let event = RatingEvent {
                id: uuid::Uuid::new_v4().to_string(),
                transaction_id: transaction_id.to_string(),
                rater_id: rater_id.to_string(),
                rated_user_id: rated_user_id.clone(),
                score,
                role,
                comment: comment.clone(),
                created_at: db::now(),
            };
            insert_event(conn, &event)?;

            let (mut summary, version) = match load_summary(conn, &rated_user_id)? {
                Some((summary, version)) => (summary, Some(version)),
                None => (RatingSummary::empty(&rated_user_id), None),
            };
            summary.fold(role.counterpart(), score);
            save_summary(conn, &summary, version)?;

            Ok(summary)
        });

        match &result {
            Ok(summary) => info!(
                transaction_id,
                rater_id,
                rated_user_id = %summary.user_id,
                score,
                "rating recorded"
            ),
            Err(err) => warn!(transaction_id, rater_id, kind = err.kind(), error = %err, "rating rejected"),
        }
        result
    }

    /// Cached summary; an all-zero summary for users nobody has rated yet
    pub fn get_summary(&self, user_id: &str) -> Result<RatingSummary> {
        self.store.read(|conn| {
            Ok(load_summary(conn, user_id)?
                .map(|(summary, _)| summary)
                .unwrap_or_else(|| RatingSummary::empty(user_id)))
        })
    }

    /// Ratings received by `user_id`, newest first
    pub fn ratings_for_user(&self, user_id: &str) -> Result<Vec<RatingEvent>> {
        let mut events = self.store.read(|conn| events_for_user(conn, user_id))?;
        events.reverse();
        Ok(events)
    }

    /// Summary recomputed from the event log, ignoring the cache
    pub fn replay_summary(&self, user_id: &str) -> Result<RatingSummary> {
        let events = self.store.read(|conn| events_for_user(conn, user_id))?;
        Ok(RatingSummary::replay(user_id, &events))
    }

    /// Overwrite the cached summary with its replay
    pub fn rebuild_summary(&self, user_id: &str) -> Result<RatingSummary> {
        self.store.write(|conn| rebuild_in(conn, user_id))
    }

    /// Rebuild every cache row, dropping rows for users with no events.
    /// Returns the number of users rebuilt.
    pub fn rebuild_all_summaries(&self) -> Result<usize> {
        let rebuilt = self.store.write(|conn| {
            let users = rated_users(conn)?;
            conn.execute(
                "DELETE FROM rating_summaries
                 WHERE user_id NOT IN (SELECT DISTINCT rated_user_id FROM rating_events)",
                [],
            )?;
            for user_id in &users {
                rebuild_in(conn, user_id)?;
            }
            Ok(users.len())
        })?;

        info!(users = rebuilt, "rating summaries rebuilt");
        Ok(rebuilt)
    }

    /// Compare every cached summary against its replay
    pub fn verify_summaries(&self) -> Result<Vec<SummaryDrift>> {
        self.store.read(|conn| {
            let mut users = rated_users(conn)?;
            let mut stmt = conn.prepare("SELECT user_id FROM rating_summaries")?;
            let cached_users = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            users.extend(cached_users);
            users.sort();
            users.dedup();

            let mut drift = Vec::new();
            for user_id in users {
                let cached = load_summary(conn, &user_id)?
                    .map(|(summary, _)| summary)
                    .unwrap_or_else(|| RatingSummary::empty(&user_id));
                let replayed = RatingSummary::replay(&user_id, &events_for_user(conn, &user_id)?);

                if cached != replayed {
                    drift.push(SummaryDrift {
                        user_id,
                        cached,
                        replayed,
                    });
                }
            }
            Ok(drift)
        })
    }
}

fn rated_users(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT rated_user_id FROM rating_events ORDER BY rated_user_id")?;
    let users = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(users)
}

fn rebuild_in(conn: &Connection, user_id: &str) -> Result<RatingSummary> {
    let replayed = RatingSummary::replay(user_id, &events_for_user(conn, user_id)?);
    let version = load_summary(conn, user_id)?.map(|(_, version)| version);
    save_summary(conn, &replayed, version)?;
    Ok(replayed)
}

// ============================================================================
// TESTS
// ============================================================================
