//! Outbound payment gateway client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Request for a hosted payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateIntentRequest {
    /// Amount in the currency's minor unit (paisa for BDT)
    pub amount_minor: i64,
    /// Lowercase ISO currency code as the gateway expects it
    pub currency: String,
    pub user_id: Uuid,
}

/// Gateway handle for an intent the client can confirm
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("gateway returned an unreadable response: {0}")]
    Decode(String),
    #[error("payment gateway is not configured")]
    NotConfigured,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, GatewayError>;
}

/// Stripe-compatible HTTP gateway: form-encoded `POST /v1/payment_intents`
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPaymentGateway {
    /// Build a gateway client using a reqwest client bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to construct reqwest client for payment gateway")?;

        Ok(Self::with_client(base_url, api_key, client))
    }

    /// Build a gateway client with a caller-provided reqwest client.
    pub fn with_client(
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: Client,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self), fields(amount_minor = request.amount_minor, currency = %request.currency))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, GatewayError> {
        let api_key = self.api_key.as_deref().ok_or(GatewayError::NotConfigured)?;
        let url = format!("{}/v1/payment_intents", self.base_url);

        let form = [
            ("amount", request.amount_minor.to_string()),
            ("currency", request.currency.clone()),
            ("metadata[user_id]", request.user_id.to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let intent = response
            .json::<GatewayIntent>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        debug!(intent_id = %intent.id, "payment intent created");
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CreateIntentRequest {
        CreateIntentRequest {
            amount_minor: 230000,
            currency: "bdt".into(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn posts_form_and_parses_intent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains("amount=230000"))
            .and(body_string_contains("currency=bdt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pi_123",
                "client_secret": "pi_123_secret_abc",
                "object": "payment_intent"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpPaymentGateway::new(
            server.uri(),
            Some("sk_test_123".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let intent = gateway.create_intent(request()).await.unwrap();

        assert_eq!(intent.id, "pi_123");
        assert_eq!(intent.client_secret, "pi_123_secret_abc");
    }

    #[tokio::test]
    async fn gateway_error_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(ResponseTemplate::new(402).set_body_string("card_declined"))
            .mount(&server)
            .await;

        let gateway = HttpPaymentGateway::new(
            server.uri(),
            Some("sk_test_123".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_matches!(
            gateway.create_intent(request()).await,
            Err(GatewayError::Rejected { status: 402, .. })
        );
    }

    #[tokio::test]
    async fn missing_api_key_is_not_configured() {
        let gateway =
            HttpPaymentGateway::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        assert_matches!(
            gateway.create_intent(request()).await,
            Err(GatewayError::NotConfigured)
        );
    }
}
