//! Two-phase, gateway-confirmed checkout.
//!
//! Phase one prices the cart server-side and records a PENDING payment for a
//! gateway intent. Phase two is the signed webhook: the PENDING → PAID flip
//! and the Cart → Order commit happen in one transaction, and only the
//! delivery whose conditional update flips the row creates the order.

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    config::AppConfig,
    entities::{payment, Payment, PaymentRecordStatus, User},
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        commerce::{
            cart_service::price_cart,
            checkout_service::{commit_cart, CheckoutService, Placement},
        },
        payment_gateway::{CreateIntentRequest, PaymentGateway},
    },
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const PAYMENT_PROVIDER: &str = "STRIPE";
pub const PAYMENT_SUCCEEDED_EVENT: &str = "payment_intent.succeeded";

/// Returned to the client so it can confirm the intent with the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentResponse {
    pub client_secret: String,
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

/// Gateway event envelope; only the fields the engine acts on
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: WebhookObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookObject {
    pub id: String,
}

/// What a webhook delivery did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    OrderCreated(Uuid),
    /// The payment was flipped to PAID but there was no cart to commit
    PaidWithoutOrder,
    AlreadyProcessed,
    UnknownTransaction,
    Ignored,
}

/// Signs `"{timestamp}.{payload}"` the way the gateway does, producing a
/// `t=...,v1=...` header value.
pub fn sign_webhook_payload(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies a `Stripe-Signature` style header against the raw body.
///
/// The timestamp must be within `tolerance_secs` of `now`, and at least one
/// `v1` signature must match; the comparison is constant time.
pub fn verify_webhook_signature(
    header: Option<&str>,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let header = header
        .ok_or_else(|| ServiceError::WebhookSignature("missing signature header".to_string()))?;

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| ServiceError::WebhookSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(ServiceError::WebhookSignature(
            "missing v1 signature".to_string(),
        ));
    }
    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(ServiceError::WebhookSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(ServiceError::WebhookSignature(
        "signature mismatch".to_string(),
    ))
}

/// Converts a payable amount to the gateway's integer minor unit.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|minor| minor.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|minor| minor.to_i64())
        .ok_or_else(|| ServiceError::ValidationError("Invalid payable amount".to_string()))
}

/// Flips a payment from PENDING to PAID. Returns false when another delivery
/// got there first.
async fn mark_paid<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
) -> Result<bool, ServiceError> {
    let flipped = Payment::update_many()
        .col_expr(
            payment::Column::Status,
            Expr::value(PaymentRecordStatus::Paid.to_value()),
        )
        .col_expr(payment::Column::PaidAt, Expr::value(Utc::now()))
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::Status.eq(PaymentRecordStatus::Pending.to_value()))
        .exec(conn)
        .await?;

    Ok(flipped.rows_affected == 1)
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    gateway: Arc<dyn PaymentGateway>,
    gateway_breaker: CircuitBreaker,
    checkout: Arc<CheckoutService>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        gateway: Arc<dyn PaymentGateway>,
        checkout: Arc<CheckoutService>,
    ) -> Self {
        let gateway_breaker = CircuitBreaker::new(
            "payment-gateway",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
                success_threshold: 1,
            },
        );

        Self {
            db,
            event_sender,
            config,
            gateway,
            gateway_breaker,
            checkout,
        }
    }

    /// Phase one: request an intent for the server-computed payable amount.
    ///
    /// No order exists after this call; a gateway failure leaves no payment row.
    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        user_id: Uuid,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let invalid = || ServiceError::ValidationError("Invalid payable amount".to_string());

        let priced = price_cart(&*self.db, user_id, self.checkout.discount_policy())
            .await?
            .filter(|priced| !priced.is_empty())
            .ok_or_else(invalid)?;

        let amount = priced.payable_amount();
        if amount <= Decimal::ZERO {
            return Err(invalid());
        }

        let request = CreateIntentRequest {
            amount_minor: to_minor_units(amount)?,
            currency: self.config.payment_currency.to_lowercase(),
            user_id,
        };

        let gateway = self.gateway.clone();
        let intent = self
            .gateway_breaker
            .call_with_timeout(self.config.external_call_timeout(), || async move {
                gateway.create_intent(request).await
            })
            .await
            .map_err(|e| {
                error!(%user_id, error = %e, "payment intent creation failed");
                ServiceError::from(e)
            })?;

        let currency = self.config.payment_currency.to_uppercase();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            amount: Set(amount),
            currency: Set(currency.clone()),
            provider: Set(PAYMENT_PROVIDER.to_string()),
            transaction_id: Set(intent.id.clone()),
            client_secret: Set(Some(intent.client_secret.clone())),
            status: Set(PaymentRecordStatus::Pending),
            created_at: Set(Utc::now()),
            paid_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        info!(%user_id, payment_id = %payment.id, transaction_id = %intent.id, %amount, "payment intent recorded");
        self.event_sender
            .send_or_log(Event::PaymentIntentCreated {
                payment_id: payment.id,
                transaction_id: intent.id,
                amount,
            })
            .await;

        Ok(PaymentIntentResponse {
            client_secret: intent.client_secret,
            payment_id: payment.id,
            amount,
            currency,
        })
    }

    /// Phase two: verify, parse and act on a gateway delivery.
    #[instrument(skip(self, signature, payload), fields(bytes = payload.len()))]
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        let secret = self.config.payment_webhook_secret.as_deref().ok_or_else(|| {
            ServiceError::WebhookSignature("webhook secret not configured".to_string())
        })?;

        if let Err(e) = verify_webhook_signature(
            signature,
            payload,
            secret,
            self.config.payment_webhook_tolerance_secs,
            Utc::now().timestamp(),
        ) {
            warn!(error = %e, "payment webhook rejected");
            metrics::increment_counter!("storefront_webhook_rejected_total");
            return Err(e);
        }

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

        if event.event_type != PAYMENT_SUCCEEDED_EVENT {
            info!(event_type = %event.event_type, event_id = ?event.id, "ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        }

        self.confirm_payment(&event.data.object.id).await
    }

    /// Flips the payment to PAID and commits the user's current cart.
    #[instrument(skip(self))]
    pub async fn confirm_payment(
        &self,
        transaction_id: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let Some(payment) = Payment::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .one(&txn)
            .await?
        else {
            info!(%transaction_id, "webhook for unknown transaction acknowledged");
            return Ok(WebhookOutcome::UnknownTransaction);
        };

        if payment.status == PaymentRecordStatus::Paid {
            info!(%transaction_id, "duplicate webhook delivery acknowledged");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        if !mark_paid(&txn, payment.id).await? {
            info!(%transaction_id, "payment already flipped by a concurrent delivery");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(user) = User::find_by_id(payment.user_id).one(&txn).await? else {
            warn!(%transaction_id, user_id = %payment.user_id, "paid by unknown user; no order created");
            txn.commit().await?;
            return Ok(WebhookOutcome::PaidWithoutOrder);
        };

        let placement = Placement::Gateway {
            payment_id: payment.id,
        };
        let policy = self.checkout.discount_policy();
        let placed = match commit_cart(&txn, &user, placement, policy).await {
            Ok(placed) => placed,
            Err(e) => {
                error!(%transaction_id, error = %e, "order commit failed; payment left pending for retry");
                return Err(e);
            }
        };

        let Some(placed) = placed else {
            warn!(%transaction_id, user_id = %user.id, "payment succeeded with an empty cart; no order created");
            txn.commit().await?;
            self.event_sender
                .send_or_log(Event::PaymentSucceeded {
                    payment_id: payment.id,
                    order_id: None,
                })
                .await;
            return Ok(WebhookOutcome::PaidWithoutOrder);
        };

        if placed.order.order.payable_amount != payment.amount {
            warn!(
                %transaction_id,
                paid = %payment.amount,
                payable = %placed.order.order.payable_amount,
                "cart changed between intent and confirmation"
            );
        }

        txn.commit().await?;

        let order_id = placed.order.order.id;
        info!(%transaction_id, %order_id, "gateway order placed");
        self.event_sender
            .send_or_log(Event::PaymentSucceeded {
                payment_id: payment.id,
                order_id: Some(order_id),
            })
            .await;
        self.checkout.after_commit(&placed).await;

        Ok(WebhookOutcome::OrderCreated(order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn signed_payload_verifies() {
        let body = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign_webhook_payload(SECRET, 1_700_000_000, body).unwrap();
        assert!(verify_webhook_signature(Some(&header), body, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign_webhook_payload(SECRET, 1_700_000_000, b"original").unwrap();
        assert_matches!(
            verify_webhook_signature(Some(&header), b"tampered", SECRET, 300, 1_700_000_000),
            Err(ServiceError::WebhookSignature(_))
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let header = sign_webhook_payload(SECRET, 1_700_000_000, b"body").unwrap();
        assert_matches!(
            verify_webhook_signature(Some(&header), b"body", SECRET, 300, 1_700_000_301),
            Err(ServiceError::WebhookSignature(_))
        );
    }

    #[test]
    fn missing_or_garbled_header_is_rejected() {
        assert!(verify_webhook_signature(None, b"body", SECRET, 300, 0).is_err());
        assert!(verify_webhook_signature(Some("t=abc"), b"body", SECRET, 300, 0).is_err());
        assert!(verify_webhook_signature(Some("t=0,v1=zz"), b"body", SECRET, 300, 0).is_err());

        let extreme = format!("t={},v1=00", i64::MIN);
        assert_matches!(
            verify_webhook_signature(Some(&extreme), b"body", SECRET, 300, 1_700_000_000),
            Err(ServiceError::WebhookSignature(_))
        );
    }

    #[test]
    fn any_matching_v1_signature_is_accepted() {
        let good = sign_webhook_payload(SECRET, 10, b"body").unwrap();
        let v1 = good.split_once("v1=").map(|(_, sig)| sig).unwrap();
        let header = format!("t=10,v1={},v1={}", "00".repeat(32), v1);
        assert!(verify_webhook_signature(Some(&header), b"body", SECRET, 300, 10).is_ok());
    }

    #[test]
    fn minor_units_round_to_paisa() {
        assert_eq!(to_minor_units(dec!(2300)).unwrap(), 230000);
        assert_eq!(to_minor_units(dec!(10.005)).unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(10.004)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(99.99)).unwrap(), 9999);
    }

    async fn pending_payment() -> (sea_orm::DatabaseConnection, payment::Model) {
        use sea_orm_migration::MigratorTrait;

        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        crate::migrator::Migrator::up(&db, None).await.unwrap();

        let row = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(Uuid::new_v4()),
            amount: Set(dec!(1800)),
            currency: Set("BDT".into()),
            provider: Set("STRIPE".into()),
            transaction_id: Set("pi_cas".into()),
            client_secret: Set(None),
            status: Set(PaymentRecordStatus::Pending),
            created_at: Set(Utc::now()),
            paid_at: Set(None),
        }
        .insert(&db)
        .await
        .unwrap();
        (db, row)
    }

    #[tokio::test]
    async fn first_flip_marks_payment_paid() {
        let (db, pending) = pending_payment().await;

        assert!(mark_paid(&db, pending.id).await.unwrap());

        let row = Payment::find_by_id(pending.id).one(&db).await.unwrap().unwrap();
        assert_eq!(row.status, PaymentRecordStatus::Paid);
        assert!(row.paid_at.is_some());
    }

    #[tokio::test]
    async fn flip_after_a_competing_delivery_is_refused() {
        let (db, pending) = pending_payment().await;
        let txn = db.begin().await.unwrap();

        // Status was read as PENDING; a competing delivery settles the row
        // before this one reaches its update.
        let stale = Payment::find_by_id(pending.id).one(&txn).await.unwrap().unwrap();
        assert_eq!(stale.status, PaymentRecordStatus::Pending);
        let winner_paid_at = Utc::now() - chrono::Duration::seconds(30);
        let mut winner: payment::ActiveModel = stale.clone().into();
        winner.status = Set(PaymentRecordStatus::Paid);
        winner.paid_at = Set(Some(winner_paid_at));
        winner.update(&txn).await.unwrap();

        assert!(!mark_paid(&txn, stale.id).await.unwrap());
        txn.commit().await.unwrap();

        let row = Payment::find_by_id(pending.id).one(&db).await.unwrap().unwrap();
        assert_eq!(row.status, PaymentRecordStatus::Paid);
        assert_eq!(
            row.paid_at.map(|at| at.timestamp()),
            Some(winner_paid_at.timestamp())
        );
    }

    #[test]
    fn webhook_event_parses_payment_intent_id() {
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_42", "amount": 1000 } }
        }))
        .unwrap();
        assert_eq!(event.event_type, PAYMENT_SUCCEEDED_EVENT);
        assert_eq!(event.data.object.id, "pi_42");
    }
}
