use crate::handlers::common::{map_service_error, success_response, validate_input};
use crate::{
    auth::AuthUser,
    errors::ApiError,
    services::commerce::cart_service::AddToCartInput,
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for the caller's cart
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_to_cart))
        .route(
            "/items/:item_id",
            put(update_cart_item).delete(remove_cart_item),
        )
        .route("/coupon", post(apply_coupon).delete(remove_coupon))
}

/// Get the caller's cart, freshly priced
async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .get_cart(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Add a variant to the cart, merging with an existing line
async fn add_to_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = AddToCartInput {
        variant_id: payload.variant_id,
        quantity: payload.quantity,
    };

    let cart = state
        .services
        .cart
        .add_to_cart(user.user_id, input)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Set a line's quantity; zero removes the line
async fn update_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .update_cart_item(user.user_id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn remove_cart_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .remove_cart_item(user.user_id, item_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Attach a coupon after running it through the validator
async fn apply_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .cart
        .apply_coupon(user.user_id, &payload.code)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

async fn remove_coupon(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let cart = state
        .services
        .cart
        .remove_coupon(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(max = 64))]
    pub code: String,
}
