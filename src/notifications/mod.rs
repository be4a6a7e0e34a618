//! Post-commit customer notifications: invoice rendering and email dispatch.
//!
//! Both collaborators sit behind traits so deployments can plug in a real
//! renderer or mail relay. The [`Notifier`] bounds every call with a timeout
//! and a circuit breaker and never propagates a failure to the caller: a
//! committed order stands whatever happens here.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::AppConfig;
use crate::entities::{OrderItemModel, OrderModel, RefundRequestModel, RefundStatus};
use crate::events::{Event, EventSender, NotificationKind};

/// Notification collaborator errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Invoice rendering failed: {0}")]
    Render(String),
    #[error("Email delivery failed: {0}")]
    Delivery(String),
}

/// Everything the invoice collaborator needs: the order and its frozen lines
#[derive(Debug, Clone)]
pub struct OrderDocument {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

/// Rendered document ready to attach to an email
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait InvoiceRenderer: Send + Sync {
    async fn render(&self, document: &OrderDocument) -> Result<Attachment, NotificationError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError>;
}

/// Plain-text invoice renderer
#[derive(Debug, Clone, Default)]
pub struct TextInvoiceRenderer;

#[async_trait]
impl InvoiceRenderer for TextInvoiceRenderer {
    async fn render(&self, document: &OrderDocument) -> Result<Attachment, NotificationError> {
        let order = &document.order;
        let mut out = String::new();
        let render_err = |e: std::fmt::Error| NotificationError::Render(e.to_string());

        writeln!(out, "INVOICE No. {}", order.id).map_err(render_err)?;
        writeln!(out, "Date: {}", order.created_at.format("%d/%m/%Y")).map_err(render_err)?;
        writeln!(out, "Billed to: {} <{}>", order.name, order.email).map_err(render_err)?;
        if let Some(address) = &order.address {
            writeln!(out, "Address: {}", address).map_err(render_err)?;
        }
        writeln!(out).map_err(render_err)?;

        for item in &document.items {
            writeln!(
                out,
                "{} x {} @ {:.2} = {:.2}",
                item.variant_id,
                item.quantity,
                item.price,
                item.price * rust_decimal::Decimal::from(item.quantity)
            )
            .map_err(render_err)?;
        }

        writeln!(out).map_err(render_err)?;
        writeln!(out, "Total: {:.2}/-", order.total_amount).map_err(render_err)?;
        writeln!(out, "Discount: -{:.2}/-", order.discount_amount).map_err(render_err)?;
        writeln!(out, "Payable: {:.2}/-", order.payable_amount).map_err(render_err)?;

        Ok(Attachment {
            file_name: format!("invoice-{}.txt", order.id),
            content_type: "text/plain".to_string(),
            content: Bytes::from(out),
        })
    }
}

/// Mailer that only records the message in the log
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        info!(
            recipient = %message.recipient,
            subject = %message.subject,
            attachments = message.attachments.len(),
            "email dispatched"
        );
        Ok(())
    }
}

/// Bounded, breaker-guarded dispatch of order notifications
#[derive(Clone)]
pub struct Notifier {
    renderer: Arc<dyn InvoiceRenderer>,
    mailer: Arc<dyn EmailSender>,
    invoice_breaker: CircuitBreaker,
    email_breaker: CircuitBreaker,
    call_timeout: Duration,
    event_sender: Arc<EventSender>,
}

impl Notifier {
    pub fn new(
        renderer: Arc<dyn InvoiceRenderer>,
        mailer: Arc<dyn EmailSender>,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
    ) -> Self {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
            success_threshold: 1,
        };

        Self {
            renderer,
            mailer,
            invoice_breaker: CircuitBreaker::new("invoice-renderer", breaker_config.clone()),
            email_breaker: CircuitBreaker::new("email-sender", breaker_config),
            call_timeout: config.external_call_timeout(),
            event_sender,
        }
    }

    /// Renders the invoice and sends the confirmation email with it attached.
    /// Returns whether the email went out.
    #[instrument(skip_all, fields(order_id = %document.order.id))]
    pub async fn order_confirmed(&self, document: &OrderDocument) -> bool {
        let order_id = document.order.id;
        let renderer = self.renderer.clone();

        let invoice = match self
            .invoice_breaker
            .call_with_timeout(self.call_timeout, || async move {
                renderer.render(document).await
            })
            .await
        {
            Ok(invoice) => invoice,
            Err(e) => {
                self.report(order_id, NotificationKind::Invoice, e.to_string())
                    .await;
                return false;
            }
        };

        let message = EmailMessage {
            recipient: document.order.email.clone(),
            subject: "Your Order Has Been Confirmed - Thank You for Shopping with Us!".to_string(),
            body: confirmation_body(document),
            attachments: vec![invoice],
        };

        self.deliver(order_id, NotificationKind::ConfirmationEmail, message)
            .await
    }

    /// Tells the customer their order was cancelled.
    #[instrument(skip_all, fields(order_id = %order.id))]
    pub async fn order_cancelled(&self, order: &OrderModel) -> bool {
        let message = EmailMessage {
            recipient: order.email.clone(),
            subject: "Order Cancelled".to_string(),
            body: format!(
                "Your order #{} has been cancelled.\nIf this was a mistake, please contact support.",
                order.id
            ),
            attachments: Vec::new(),
        };

        self.deliver(order.id, NotificationKind::CancellationEmail, message)
            .await
    }

    /// Acknowledges a new refund request to the order's contact address.
    #[instrument(skip_all, fields(order_id = %order.id))]
    pub async fn refund_requested(&self, order: &OrderModel) -> bool {
        let message = EmailMessage {
            recipient: order.email.clone(),
            subject: "Refund Request Received".to_string(),
            body: format!(
                "We have received your refund request for order #{}.\n\
                 Our team will review it and get back to you.",
                order.id
            ),
            attachments: Vec::new(),
        };

        self.deliver(order.id, NotificationKind::RefundEmail, message)
            .await
    }

    /// Tells the customer an admin approved or rejected their refund request.
    #[instrument(skip_all, fields(order_id = %refund.order_id, status = %refund.status))]
    pub async fn refund_decided(&self, recipient: &str, refund: &RefundRequestModel) -> bool {
        let (subject, body) = match refund.status {
            RefundStatus::Approved => (
                "Refund Approved",
                format!(
                    "Your refund request for order #{} has been approved.",
                    refund.order_id
                ),
            ),
            _ => (
                "Refund Rejected",
                format!(
                    "Your refund request for order #{} has been rejected.\nReason: {}",
                    refund.order_id,
                    refund.admin_note.as_deref().unwrap_or("Not specified")
                ),
            ),
        };

        let message = EmailMessage {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body,
            attachments: Vec::new(),
        };

        self.deliver(refund.order_id, NotificationKind::RefundEmail, message)
            .await
    }

    async fn deliver(
        &self,
        order_id: uuid::Uuid,
        kind: NotificationKind,
        message: EmailMessage,
    ) -> bool {
        let mailer = self.mailer.clone();
        match self
            .email_breaker
            .call_with_timeout(self.call_timeout, || async move { mailer.send(message).await })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.report(order_id, kind, e.to_string()).await;
                false
            }
        }
    }

    async fn report(&self, order_id: uuid::Uuid, kind: NotificationKind, error: String) {
        error!(%order_id, ?kind, %error, "notification failed after commit");
        metrics::increment_counter!(
            "storefront_notification_failures_total",
            "kind" => format!("{:?}", kind)
        );
        self.event_sender
            .send_or_log(Event::NotificationFailed {
                order_id,
                kind,
                error,
            })
            .await;
    }
}

fn confirmation_body(document: &OrderDocument) -> String {
    let order = &document.order;
    let estimated_delivery = (Utc::now() + ChronoDuration::days(7)).format("%d/%m/%Y");
    let mut body = format!(
        "Dear {},\n\nYour order #{} has been confirmed.\n\n",
        order.name, order.id
    );
    for item in &document.items {
        body.push_str(&format!(
            "- {} x {} @ {:.2}/-\n",
            item.variant_id, item.quantity, item.price
        ));
    }
    body.push_str(&format!(
        "\nTotal Amount: {:.2}/-\nDiscount: -{:.2}/-\nPayable Amount: {:.2}/-\nEstimated Delivery Date: {}\n",
        order.total_amount, order.discount_amount, order.payable_amount, estimated_delivery
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{OrderStatus, PaymentMethod, PaymentStatus};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct FailingRenderer;

    #[async_trait]
    impl InvoiceRenderer for FailingRenderer {
        async fn render(&self, _document: &OrderDocument) -> Result<Attachment, NotificationError> {
            Err(NotificationError::Render("disk full".into()))
        }
    }

    #[derive(Default)]
    struct CountingMailer {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl EmailSender for CountingMailer {
        async fn send(&self, _message: EmailMessage) -> Result<(), NotificationError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn document() -> OrderDocument {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        OrderDocument {
            order: OrderModel {
                id: order_id,
                user_id: Uuid::new_v4(),
                name: "Rahim".into(),
                email: "rahim@shop.test".into(),
                contact_number: None,
                address: Some("Road 1, Dhaka".into()),
                country: Some("Bangladesh".into()),
                total_amount: dec!(2400),
                discount_amount: dec!(100),
                payable_amount: dec!(2300),
                coupon_code: Some("SAVE10".into()),
                payment_method: PaymentMethod::CashOnDelivery,
                payment_status: PaymentStatus::AwaitingPayment,
                status: OrderStatus::Pending,
                payment_id: None,
                created_at: now,
                updated_at: now,
            },
            items: vec![OrderItemModel {
                id: Uuid::new_v4(),
                order_id,
                variant_id: Uuid::new_v4(),
                quantity: 2,
                price: dec!(1200),
                created_at: now,
            }],
        }
    }

    fn config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "x".repeat(64),
            "127.0.0.1".into(),
            8080,
            "development".into(),
        )
    }

    #[tokio::test]
    async fn text_invoice_lists_lines_and_totals() {
        let invoice = TextInvoiceRenderer.render(&document()).await.unwrap();
        let text = String::from_utf8(invoice.content.to_vec()).unwrap();
        assert!(text.contains("2 @ 1200.00 = 2400.00"));
        assert!(text.contains("Payable: 2300.00/-"));
        assert!(invoice.file_name.starts_with("invoice-"));
    }

    #[tokio::test]
    async fn render_failure_is_reported_not_raised() {
        let (tx, mut rx) = mpsc::channel(8);
        let mailer = Arc::new(CountingMailer::default());
        let notifier = Notifier::new(
            Arc::new(FailingRenderer),
            mailer.clone(),
            &config(),
            Arc::new(EventSender::new(tx)),
        );

        assert!(!notifier.order_confirmed(&document()).await);
        assert_eq!(mailer.sent.load(Ordering::SeqCst), 0);
        assert!(matches!(
            rx.recv().await,
            Some(Event::NotificationFailed {
                kind: NotificationKind::Invoice,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_email_is_sent() {
        let (tx, _rx) = mpsc::channel(8);
        let mailer = Arc::new(CountingMailer::default());
        let notifier = Notifier::new(
            Arc::new(TextInvoiceRenderer),
            mailer.clone(),
            &config(),
            Arc::new(EventSender::new(tx)),
        );

        assert!(notifier.order_cancelled(&document().order).await);
        assert_eq!(mailer.sent.load(Ordering::SeqCst), 1);
    }
}
