use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::{errors::ServiceError, AppState};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

// POST /api/v1/payments/webhook
//
// Unauthenticated; trust comes from the signature over the raw body.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state
        .services
        .payments
        .handle_webhook(signature, &body)
        .await?;

    debug!(?outcome, "payment webhook acknowledged");
    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
