use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the bus is closed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Which external collaborator failed after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Invoice,
    ConfirmationEmail,
    CancellationEmail,
    RefundEmail,
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartUpdated(Uuid),
    CouponApplied {
        user_id: Uuid,
        code: String,
        discount: Decimal,
    },
    CouponDetached {
        user_id: Uuid,
        code: String,
        reason: String,
    },

    // Order events
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentIntentCreated {
        payment_id: Uuid,
        transaction_id: String,
        amount: Decimal,
    },
    PaymentSucceeded {
        payment_id: Uuid,
        order_id: Option<Uuid>,
    },

    // Refund events
    RefundRequested {
        refund_id: Uuid,
        order_id: Uuid,
    },
    RefundDecided {
        refund_id: Uuid,
        status: String,
    },

    // Inventory events
    InventoryAdjusted {
        variant_id: Uuid,
        delta: i32,
        reason: String,
    },

    NotificationFailed {
        order_id: Uuid,
        kind: NotificationKind,
        error: String,
    },
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::CartUpdated(user_id) => {
                info!(%user_id, "cart updated");
            }
            Event::CouponApplied {
                user_id,
                code,
                discount,
            } => {
                info!(%user_id, %code, %discount, "coupon applied");
            }
            Event::CouponDetached {
                user_id,
                code,
                reason,
            } => {
                info!(%user_id, %code, %reason, "coupon detached from cart");
            }
            Event::OrderCreated(order_id) => {
                info!(%order_id, "order created");
            }
            Event::OrderCancelled(order_id) => {
                info!(%order_id, "order cancelled");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::PaymentIntentCreated {
                payment_id,
                transaction_id,
                amount,
            } => {
                info!(%payment_id, %transaction_id, %amount, "payment intent created");
            }
            Event::PaymentSucceeded {
                payment_id,
                order_id,
            } => {
                info!(%payment_id, ?order_id, "payment succeeded");
            }
            Event::InventoryAdjusted {
                variant_id,
                delta,
                reason,
            } => {
                info!(%variant_id, delta, %reason, "inventory adjusted");
            }
            Event::RefundRequested {
                refund_id,
                order_id,
            } => {
                info!(%refund_id, %order_id, "refund requested");
            }
            Event::RefundDecided { refund_id, status } => {
                info!(%refund_id, %status, "refund decided");
            }
            // TODO: feed these into a retry queue instead of only logging them
            Event::NotificationFailed {
                order_id,
                kind,
                error,
            } => {
                warn!(%order_id, ?kind, %error, "post-commit notification failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender.send(Event::OrderCreated(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderCreated(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_or_log_survives_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender.send(Event::CartUpdated(Uuid::new_v4())).await.is_err());
        sender.send_or_log(Event::CartUpdated(Uuid::new_v4())).await;
    }
}
