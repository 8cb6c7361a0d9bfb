// REST API with Axum
//
// Transport-only: every handler hops onto the blocking pool and calls one
// Exchange operation. The upstream auth layer has already resolved who the
// caller is and passes it as actor_id / rater_id.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::dispute::{DisputeEntry, DisputedTransaction};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::rating::{RatingEvent, RatingSummary};
use crate::transaction::{NewTransaction, Transaction};

/// Shared application state
#[derive(Clone)]
struct AppState {
    exchange: Arc<Exchange>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        let status = match &err {
            ExchangeError::NotFound { .. } => StatusCode::NOT_FOUND,
            ExchangeError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            ExchangeError::TerminalState { .. }
            | ExchangeError::InvalidState { .. }
            | ExchangeError::DuplicateRating { .. }
            | ExchangeError::Conflict { .. } => StatusCode::CONFLICT,
            ExchangeError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ExchangeError::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ExchangeError::Storage(_) | ExchangeError::Serialization(_) => {
                error!(error = %err, "internal failure serving request");
                return ApiError::internal("internal error");
            }
        };

        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind: self.kind,
                message: self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Run one blocking Exchange call off the async executor
async fn run<T, F>(state: AppState, op: F) -> ApiResult<T>
where
    F: FnOnce(&Exchange) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let exchange = state.exchange;
    let value = tokio::task::spawn_blocking(move || op(&exchange))
        .await
        .map_err(|err| {
            error!(error = %err, "blocking task failed");
            ApiError::internal("internal error")
        })??;

    Ok(Json(ApiResponse::ok(value)))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct ActorRequest {
    actor_id: String,
}

#[derive(Deserialize)]
struct DisagreeRequest {
    actor_id: String,
    reason: String,
}

#[derive(Deserialize)]
struct RatingRequest {
    rater_id: String,
    score: i64,
    #[serde(default)]
    comment: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/transactions - offer accepted, open the transaction for its thread
async fn open_transaction(
    State(state): State<AppState>,
    Json(body): Json<NewTransaction>,
) -> ApiResult<Transaction> {
    run(state, move |ex| ex.open_transaction(body)).await
}

/// GET /api/transactions/:id
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Transaction> {
    run(state, move |ex| ex.get_transaction(&id)).await
}

/// POST /api/transactions/:id/mark-complete
async fn mark_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActorRequest>,
) -> ApiResult<Transaction> {
    run(state, move |ex| ex.mark_complete(&id, &body.actor_id)).await
}

/// POST /api/transactions/:id/agree
async fn agree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActorRequest>,
) -> ApiResult<Transaction> {
    run(state, move |ex| ex.agree(&id, &body.actor_id)).await
}

/// POST /api/transactions/:id/disagree
async fn disagree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DisagreeRequest>,
) -> ApiResult<Transaction> {
    run(state, move |ex| ex.disagree(&id, &body.actor_id, &body.reason)).await
}

/// GET /api/transactions/:id/disputes - ledger history for one transaction
async fn transaction_disputes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<DisputeEntry>> {
    run(state, move |ex| ex.dispute_entries(&id)).await
}

/// POST /api/transactions/:id/ratings
async fn submit_rating(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RatingRequest>,
) -> ApiResult<RatingSummary> {
    run(state, move |ex| {
        ex.submit_rating(&id, &body.rater_id, body.score, body.comment.as_deref())
    })
    .await
}

/// GET /api/users/:id/summary
async fn user_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<RatingSummary> {
    run(state, move |ex| ex.get_summary(&user_id)).await
}

/// GET /api/users/:id/transactions
async fn user_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<Transaction>> {
    run(state, move |ex| ex.transactions_for_user(&user_id)).await
}

/// GET /api/users/:id/ratings
async fn user_ratings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<RatingEvent>> {
    run(state, move |ex| ex.ratings_for_user(&user_id)).await
}

/// GET /api/disputes - everything awaiting admin resolution
async fn list_disputes(State(state): State<AppState>) -> ApiResult<Vec<DisputedTransaction>> {
    run(state, |ex| ex.list_disputed()).await
}

// ============================================================================
// Router
// ============================================================================

pub fn router(exchange: Arc<Exchange>) -> Router {
    let state = AppState { exchange };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/transactions", post(open_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/mark-complete", post(mark_complete))
        .route("/transactions/:id/agree", post(agree))
        .route("/transactions/:id/disagree", post(disagree))
        .route("/transactions/:id/disputes", get(transaction_disputes))
        .route("/transactions/:id/ratings", post(submit_rating))
        .route("/users/:id/summary", get(user_summary))
        .route("/users/:id/transactions", get(user_transactions))
        .route("/users/:id/ratings", get(user_ratings))
        .route("/disputes", get(list_disputes))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_store;
    use crate::notify::RecordingEmitter;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (TempDir, Router, Arc<Exchange>) {
        let (dir, store) = test_store();
        let exchange = Arc::new(Exchange::new(store, Arc::new(RecordingEmitter::new())));
        (dir, router(exchange.clone()), exchange)
    }

    fn open(exchange: &Exchange) -> Transaction {
        exchange
            .open_transaction(NewTransaction {
                thread_id: "th-1".to_string(),
                listing_id: "lst-1".to_string(),
                buyer_id: "u-buyer".to_string(),
                seller_id: "u-seller".to_string(),
            })
            .unwrap()
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app, _exchange) = app();
        let (status, json) = call(&app, "GET", "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], "OK");
    }

    #[tokio::test]
    async fn test_completion_flow_over_http() {
        let (_dir, app, exchange) = app();
        let tx = open(&exchange);

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/mark-complete", tx.id),
            Some(serde_json::json!({"actor_id": "u-buyer"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "pending_b");

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/agree", tx.id),
            Some(serde_json::json!({"actor_id": "u-seller"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "completed");

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/ratings", tx.id),
            Some(serde_json::json!({"rater_id": "u-buyer", "score": 5, "comment": "great"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["seller_average"], 5.0);

        let (status, json) = call(&app, "GET", "/api/users/u-seller/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["overall_count"], 1);
    }

    #[tokio::test]
    async fn test_errors_carry_kind_and_status() {
        let (_dir, app, exchange) = app();
        let tx = open(&exchange);

        let (status, json) = call(&app, "GET", "/api/transactions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "not_found");

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/mark-complete", tx.id),
            Some(serde_json::json!({"actor_id": "u-stranger"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"]["kind"], "not_participant");

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/disagree", tx.id),
            Some(serde_json::json!({"actor_id": "u-seller", "reason": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["kind"], "validation");

        let (status, json) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/agree", tx.id),
            Some(serde_json::json!({"actor_id": "u-seller"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["kind"], "invalid_state");
    }

    #[tokio::test]
    async fn test_disputes_listing() {
        let (_dir, app, exchange) = app();
        let tx = open(&exchange);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/transactions/{}/disagree", tx.id),
            Some(serde_json::json!({"actor_id": "u-seller", "reason": "item not as described"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = call(&app, "GET", "/api/disputes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"][0]["transaction"]["state"], "disputed");
        assert_eq!(json["data"][0]["entry"]["raised_by"], "u-seller");
    }
}
