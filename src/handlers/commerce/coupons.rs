use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::{errors::ApiError, services::commerce::CreateCouponInput, AppState};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{get, patch},
    Router,
};
use uuid::Uuid;

/// Admin coupon management
pub fn coupons_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_coupons).post(create_coupon))
        .route("/:id/deactivate", patch(deactivate_coupon))
}

async fn create_coupon(
    State(state): State<AppState>,
    Json(payload): Json<CreateCouponInput>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .create_coupon(payload)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(coupon))
}

async fn list_coupons(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let coupons = state
        .services
        .coupons
        .list_coupons()
        .await
        .map_err(map_service_error)?;

    Ok(success_response(coupons))
}

/// Soft delete
async fn deactivate_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .deactivate_coupon(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(coupon))
}
