use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::handlers::common::{
    created_response, map_service_error, success_response, PageQuery, PaginatedResponse,
};
use crate::{
    auth::AuthUser,
    entities::OrderStatus,
    errors::{ApiError, ServiceError},
    services::orders::OrderListQuery,
    AppState,
};

/// Customer order routes
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/cod", post(place_cod_order))
        .route("/my", get(my_orders))
        .route("/:id", get(get_order))
        .route("/:id/cancel", put(cancel_order))
}

/// Admin order routes
pub fn admin_orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:id/status", put(update_order_status))
}

/// Commit the caller's cart as a cash-on-delivery order
async fn place_cod_order(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .checkout
        .place_cod_order(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(order))
}

async fn my_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .services
        .orders
        .my_orders(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(orders))
}

/// One order; visible to its owner and to admins
async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .get_order(id)
        .await
        .map_err(map_service_error)?;

    if order.order.user_id != user.user_id && !user.is_admin() {
        return Err(map_service_error(ServiceError::Forbidden(
            "You cannot view this order".to_string(),
        )));
    }

    Ok(success_response(order))
}

async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .cancel_order(user.user_id, id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersParams {
    pub status: Option<String>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<ListOrdersParams>,
) -> Result<impl IntoResponse, ApiError> {
    let pagination = PageQuery {
        page: params.page,
        per_page: params.per_page,
    }
    .resolve()?;

    let status = params
        .status
        .as_deref()
        .map(|raw| {
            OrderStatus::from_str(raw.trim())
                .map_err(|_| ServiceError::ValidationError("Invalid order status".to_string()))
        })
        .transpose()
        .map_err(map_service_error)?;

    let (orders, total) = state
        .services
        .orders
        .list_orders(OrderListQuery {
            status,
            page: pagination.page,
            per_page: pagination.per_page,
        })
        .await
        .map_err(map_service_error)?;

    Ok(success_response(PaginatedResponse::new(
        orders, pagination, total,
    )))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order = state
        .services
        .orders
        .update_status(id, &payload.status)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(order))
}
