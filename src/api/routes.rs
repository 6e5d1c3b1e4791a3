//! REST endpoints over the intake pipeline and the funnel.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::error::FunnelError;
use crate::funnel::{FunnelStage, FunnelStateMachine, Priority, RequestFilter, RequestUpdate};
use crate::pipeline::PollingScheduler;
use crate::pipeline::types::{MessageFilter, MessageStatus};
use crate::store::Database;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<PollingScheduler>,
    pub funnel: Arc<FunnelStateMachine>,
    pub db: Arc<dyn Database>,
}

/// Build the full router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/emails", get(list_emails))
        .route("/api/emails/process", post(process_emails))
        .route("/api/emails/stats", get(email_stats))
        .route("/api/emails/{id}", get(get_email))
        .route("/api/emails/{id}/reprocess", post(reprocess_email))
        .route("/api/requests", get(list_requests))
        .route("/api/requests/stats", get(request_stats))
        .route("/api/requests/{id}", get(get_request).put(update_request))
        .route("/api/requests/{id}/assign", post(assign_request))
        .route("/api/requests/{id}/stage", put(update_stage))
        .route("/api/requests/{id}/history", get(request_history))
        .route("/api/requests/{id}/thread", get(request_thread))
        .route("/api/requests/{id}/quotation-sent", post(quotation_sent))
        .route("/api/forwarding/stats", get(forwarding_stats))
        .route("/api/polling/status", get(polling_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "success": false, "error": message.into() }))).into_response()
}

fn funnel_error(e: FunnelError) -> Response {
    match e {
        FunnelError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, e.to_string()),
        FunnelError::Validation(_) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        FunnelError::Database(_) => {
            error!("API storage error: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn parse_opt<T>(value: Option<&str>) -> Result<Option<T>, FunnelError>
where
    T: std::str::FromStr<Err = FunnelError>,
{
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .transpose()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "funnel-intake"
    }))
}

// ── Emails ──────────────────────────────────────────────────────────────

async fn process_emails(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.scheduler.sweep().await;
    let count = report.processed_count();
    Json(json!({
        "success": true,
        "message": format!("Processed {count} email(s)"),
        "processedCount": count,
        "results": report.results,
        "accounts": report.accounts,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailQuery {
    account: Option<String>,
    status: Option<String>,
    start_date: Option<chrono::DateTime<chrono::Utc>>,
    end_date: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
}

async fn list_emails(
    State(state): State<AppState>,
    Query(query): Query<EmailQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => match MessageStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid status '{s}', expected pending or processed"),
                );
            }
        },
        None => None,
    };
    let filter = MessageFilter {
        account: query.account,
        status,
        start_date: query.start_date,
        end_date: query.end_date,
        limit: query.limit,
    };
    match state.db.list_messages(&filter).await {
        Ok(messages) => Json(json!({ "success": true, "emails": messages })).into_response(),
        Err(e) => funnel_error(e.into()),
    }
}

async fn email_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.db.message_stats().await.unwrap_or_else(|e| {
        warn!("Message stats unavailable: {e}");
        Default::default()
    });
    Json(json!({ "success": true, "stats": stats }))
}

async fn get_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let message = match state.db.get_message(&id).await {
        Ok(Some(message)) => message,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, format!("email not found: {id}")),
        Err(e) => return funnel_error(e.into()),
    };

    let attachments = state.db.list_attachments(&id).await.unwrap_or_else(|e| {
        warn!(id = %id, "Cannot list attachments: {e}");
        Vec::new()
    });
    let extracted = state.db.get_extracted_data(&id).await.unwrap_or_else(|e| {
        warn!(id = %id, "Cannot read extracted data: {e}");
        None
    });
    let attempts = state.db.list_forwarding_attempts(&id).await.unwrap_or_else(|e| {
        warn!(id = %id, "Cannot list forwarding attempts: {e}");
        Vec::new()
    });

    Json(json!({
        "success": true,
        "email": message,
        "attachments": attachments,
        "extractedData": extracted,
        "forwardingAttempts": attempts,
    }))
    .into_response()
}

async fn reprocess_email(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.scheduler.pipeline().reprocess(&id).await {
        Ok(outcome) => Json(json!({ "success": true, "result": outcome })).into_response(),
        Err(e) => funnel_error(e),
    }
}

// ── Requests ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestQuery {
    funnel_stage: Option<String>,
    assigned_user_id: Option<String>,
    priority: Option<String>,
    customer_email: Option<String>,
    limit: Option<usize>,
}

impl RequestQuery {
    fn into_filter(self) -> Result<RequestFilter, FunnelError> {
        Ok(RequestFilter {
            funnel_stage: parse_opt::<FunnelStage>(self.funnel_stage.as_deref())?,
            priority: parse_opt::<Priority>(self.priority.as_deref())?,
            assigned_user_id: self.assigned_user_id,
            customer_email: self.customer_email,
            limit: self.limit,
        })
    }
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<RequestQuery>,
) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(e) => return funnel_error(e),
    };
    match state.funnel.list(&filter).await {
        Ok(requests) => Json(json!({ "success": true, "requests": requests })).into_response(),
        Err(e) => funnel_error(e),
    }
}

async fn request_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.funnel.stats().await.unwrap_or_else(|e| {
        warn!("Request stats unavailable: {e}");
        Default::default()
    });
    Json(json!({ "success": true, "stats": stats }))
}

async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.funnel.get(&id).await {
        Ok(request) => Json(json!({ "success": true, "request": request })).into_response(),
        Err(e) => funnel_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    requirements: Option<String>,
    priority: Option<String>,
    funnel_stage: Option<String>,
}

async fn update_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Response {
    let update = match (
        parse_opt::<Priority>(body.priority.as_deref()),
        parse_opt::<FunnelStage>(body.funnel_stage.as_deref()),
    ) {
        (Ok(priority), Ok(funnel_stage)) => RequestUpdate {
            requirements: body.requirements,
            priority,
            funnel_stage,
        },
        (Err(e), _) | (_, Err(e)) => return funnel_error(e),
    };
    match state.funnel.update(&id, update).await {
        Ok(request) => Json(json!({ "success": true, "request": request })).into_response(),
        Err(e) => funnel_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignBody {
    user_id: String,
    assigned_by: String,
    notes: Option<String>,
}

async fn assign_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignBody>,
) -> Response {
    match state
        .funnel
        .assign(&id, &body.user_id, &body.assigned_by, body.notes)
        .await
    {
        Ok(request) => Json(json!({ "success": true, "request": request })).into_response(),
        Err(e) => funnel_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct StageBody {
    stage: String,
}

async fn update_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StageBody>,
) -> Response {
    match state.funnel.update_stage(&id, &body.stage).await {
        Ok(request) => Json(json!({ "success": true, "request": request })).into_response(),
        Err(e) => funnel_error(e),
    }
}

async fn request_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.funnel.history(&id).await {
        Ok(history) => Json(json!({ "success": true, "history": history })).into_response(),
        Err(e) => funnel_error(e),
    }
}

async fn request_thread(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.funnel.thread_info(&id).await {
        Ok(thread) => Json(json!({ "success": true, "thread": thread })).into_response(),
        Err(e) => funnel_error(e),
    }
}

async fn quotation_sent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.funnel.on_quotation_sent(&id).await {
        Ok(request) => Json(json!({ "success": true, "request": request })).into_response(),
        Err(e) => funnel_error(e),
    }
}

// ── Forwarding and polling ──────────────────────────────────────────────

async fn forwarding_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.db.forwarding_stats().await.unwrap_or_else(|e| {
        warn!("Forwarding stats unavailable: {e}");
        Default::default()
    });
    Json(json!({ "success": true, "stats": stats }))
}

async fn polling_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "success": true, "status": state.scheduler.status() }))
}
