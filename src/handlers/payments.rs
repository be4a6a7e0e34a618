use crate::handlers::common::{created_response, map_service_error};
use crate::{auth::AuthUser, errors::ApiError, AppState};
use axum::{extract::State, response::IntoResponse, routing::post, Router};

/// Authenticated payment routes
pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/intent", post(create_payment_intent))
}

/// Phase one of gateway checkout: an intent for the server-priced cart
async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let intent = state
        .services
        .payments
        .create_intent(user.user_id)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(intent))
}
