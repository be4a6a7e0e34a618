pub mod commerce;
pub mod common;
pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod refunds;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::notifications::{EmailSender, InvoiceRenderer, Notifier};
use crate::services::{
    commerce::{CartService, CheckoutService, CouponService},
    orders::OrderService,
    payment_gateway::PaymentGateway,
    payments::PaymentService,
    refunds::RefundService,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// External collaborators the services call out to
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub invoice_renderer: Arc<dyn InvoiceRenderer>,
    pub mailer: Arc<dyn EmailSender>,
}

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub refunds: Arc<RefundService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        collaborators: Collaborators,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(
            collaborators.invoice_renderer,
            collaborators.mailer,
            &config,
            event_sender.clone(),
        ));

        let cart = Arc::new(CartService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.clone(),
            notifier.clone(),
        ));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            notifier.clone(),
        ));
        let refunds = Arc::new(RefundService::new(
            db_pool.clone(),
            event_sender.clone(),
            notifier,
        ));
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            event_sender,
            config,
            collaborators.gateway,
            checkout.clone(),
        ));
        let coupons = Arc::new(CouponService::new(db_pool));

        Self {
            cart,
            checkout,
            coupons,
            orders,
            payments,
            refunds,
        }
    }
}
