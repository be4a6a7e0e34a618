use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::{
    auth::AuthUser,
    entities::RefundStatus,
    errors::{ApiError, ServiceError},
    services::refunds::CreateRefundInput,
    AppState,
};

/// Customer refund routes
pub fn refunds_routes() -> Router<AppState> {
    Router::new()
        .route("/request", post(request_refund))
        .route("/my", get(my_refunds))
}

/// Admin refund routes
pub fn admin_refunds_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_refunds))
        .route("/:id/approve", put(approve_refund))
        .route("/:id/reject", put(reject_refund))
}

async fn request_refund(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateRefundInput>,
) -> Result<impl IntoResponse, ApiError> {
    let refund = state
        .services
        .refunds
        .request_refund(user.user_id, payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(refund))
}

async fn my_refunds(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let refunds = state
        .services
        .refunds
        .my_refunds(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(refunds))
}

#[derive(Debug, Deserialize)]
pub struct ListRefundsParams {
    pub status: Option<String>,
}

async fn list_refunds(
    State(state): State<AppState>,
    Query(params): Query<ListRefundsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|raw| {
            RefundStatus::from_str(raw.trim())
                .map_err(|_| ServiceError::ValidationError("Invalid refund status".to_string()))
        })
        .transpose()
        .map_err(map_service_error)?;

    let refunds = state
        .services
        .refunds
        .list_refunds(status)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(refunds))
}

async fn approve_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let refund = state
        .services
        .refunds
        .approve(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(refund))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRefundRequest {
    pub admin_note: Option<String>,
}

async fn reject_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<RejectRefundRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let refund = state
        .services
        .refunds
        .reject(id, payload.admin_note)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(refund))
}
