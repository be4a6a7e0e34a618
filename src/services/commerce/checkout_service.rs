//! Cart → Order commit shared by cash-on-delivery and gateway-confirmed checkout.

use crate::{
    config::AppConfig,
    entities::{
        commerce::{coupon, Coupon},
        order, order_item, OrderStatus, PaymentMethod, PaymentStatus, User, UserModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{Notifier, OrderDocument},
    services::{
        commerce::cart_service::{clear_cart, price_cart, PricedCart},
        commerce::coupon_validator::DiscountPolicy,
        inventory,
        orders::OrderWithItems,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Which checkout path is committing the cart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    CashOnDelivery,
    /// Confirmed by the gateway for the given local payment row
    Gateway { payment_id: Uuid },
}

impl Placement {
    fn method(self) -> PaymentMethod {
        match self {
            Self::CashOnDelivery => PaymentMethod::CashOnDelivery,
            Self::Gateway { .. } => PaymentMethod::OnlinePayment,
        }
    }

    fn payment_status(self) -> PaymentStatus {
        match self {
            Self::CashOnDelivery => PaymentStatus::AwaitingPayment,
            Self::Gateway { .. } => PaymentStatus::Paid,
        }
    }

    fn initial_status(self) -> OrderStatus {
        match self {
            Self::CashOnDelivery => OrderStatus::Pending,
            Self::Gateway { .. } => OrderStatus::Accepted,
        }
    }

    fn payment_id(self) -> Option<Uuid> {
        match self {
            Self::CashOnDelivery => None,
            Self::Gateway { payment_id } => Some(payment_id),
        }
    }
}

/// A committed order plus what happened to the cart's coupon on the way
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: OrderWithItems,
    /// Coupon code dropped during commit, with the reason
    pub dropped_coupon: Option<(String, String)>,
}

/// Claims one use of a coupon. Returns false when the cap was already reached.
async fn claim_coupon_use<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
) -> Result<bool, ServiceError> {
    let result = Coupon::update_many()
        .col_expr(
            coupon::Column::UsedCount,
            Expr::col(coupon::Column::UsedCount).add(1),
        )
        .filter(coupon::Column::Id.eq(coupon_id))
        .filter(
            Condition::any()
                .add(coupon::Column::TotalUsageLimit.is_null())
                .add(
                    Expr::col(coupon::Column::UsedCount)
                        .lt(Expr::col(coupon::Column::TotalUsageLimit)),
                ),
        )
        .exec(conn)
        .await?;

    Ok(result.rows_affected == 1)
}

/// Commits the user's current cart into an order on `conn`, which must be an
/// open transaction owned by the caller.
///
/// Re-prices from live prices, then hands off to [`commit_priced`]. Returns
/// `None` when there is nothing to commit. Any error leaves the caller to
/// roll back.
pub(crate) async fn commit_cart<C: ConnectionTrait>(
    conn: &C,
    user: &UserModel,
    placement: Placement,
    policy: DiscountPolicy,
) -> Result<Option<PlacedOrder>, ServiceError> {
    match price_cart(conn, user.id, policy).await? {
        Some(priced) if !priced.is_empty() => {
            commit_priced(conn, user, placement, priced).await.map(Some)
        }
        _ => Ok(None),
    }
}

/// Inserts the order with frozen line prices, claims the coupon use,
/// decrements stock and clears the cart.
///
/// The coupon claim is conditional: if the cap was reached after `priced`
/// was computed, the order is placed at full price and the coupon is
/// reported in [`PlacedOrder::dropped_coupon`].
async fn commit_priced<C: ConnectionTrait>(
    conn: &C,
    user: &UserModel,
    placement: Placement,
    priced: PricedCart,
) -> Result<PlacedOrder, ServiceError> {
    let mut dropped_coupon = priced
        .detached
        .as_ref()
        .map(|d| (d.code.clone(), d.reason.to_string()));

    let mut discount_amount = priced.discount_amount;
    let mut coupon_code = None;
    if let Some(coupon) = &priced.coupon {
        if claim_coupon_use(conn, coupon.id).await? {
            coupon_code = Some(coupon.code.clone());
        } else {
            warn!(
                user_id = %user.id,
                code = %coupon.code,
                "coupon cap reached during checkout; order placed without it"
            );
            discount_amount = Decimal::ZERO;
            dropped_coupon = Some((
                coupon.code.clone(),
                "Coupon usage limit reached".to_string(),
            ));
        }
    }

    let now = Utc::now();
    let order_id = Uuid::new_v4();
    let order = order::ActiveModel {
        id: Set(order_id),
        user_id: Set(user.id),
        name: Set(user.name.clone()),
        email: Set(user.email.clone()),
        contact_number: Set(user.contact_number.clone()),
        address: Set(user.address.clone()),
        country: Set(user.country.clone()),
        total_amount: Set(priced.total_amount),
        discount_amount: Set(discount_amount),
        payable_amount: Set(priced.total_amount - discount_amount),
        coupon_code: Set(coupon_code),
        payment_method: Set(placement.method()),
        payment_status: Set(placement.payment_status()),
        status: Set(placement.initial_status()),
        payment_id: Set(placement.payment_id()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    let mut items = Vec::with_capacity(priced.lines.len());
    for line in &priced.lines {
        let item = order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            variant_id: Set(line.variant.id),
            quantity: Set(line.quantity),
            price: Set(line.unit_price),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;
        items.push(item);
    }

    let placed = OrderWithItems { order, items };
    inventory::decrement_lines(conn, &placed.stock_lines()).await?;
    clear_cart(conn, &priced.cart).await?;

    Ok(PlacedOrder {
        order: placed,
        dropped_coupon,
    })
}

/// Order placement for both checkout paths
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    notifier: Arc<Notifier>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
            notifier,
        }
    }

    pub fn discount_policy(&self) -> DiscountPolicy {
        DiscountPolicy {
            clamp_to_total: self.config.clamp_fixed_discount,
        }
    }

    /// Places a cash-on-delivery order from the caller's cart.
    ///
    /// The whole Cart → Order transition is one transaction; the invoice and
    /// confirmation email follow the commit and cannot undo it.
    #[instrument(skip(self))]
    pub async fn place_cod_order(&self, user_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let user = User::find_by_id(user_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))?;

        if !user.is_verified {
            return Err(ServiceError::Forbidden("Account not verified".to_string()));
        }

        let txn = self.db.begin().await?;
        let placed = commit_cart(&txn, &user, Placement::CashOnDelivery, self.discount_policy())
            .await?
            .ok_or_else(|| ServiceError::ValidationError("Cart is empty".to_string()))?;
        txn.commit().await?;

        info!(
            %user_id,
            order_id = %placed.order.order.id,
            payable = %placed.order.order.payable_amount,
            "cash on delivery order placed"
        );

        self.after_commit(&placed).await;
        Ok(placed.order)
    }

    /// Post-commit side effects: domain events, then invoice and email.
    pub async fn after_commit(&self, placed: &PlacedOrder) {
        let order = &placed.order.order;
        metrics::increment_counter!(
            "storefront_orders_placed_total",
            "method" => format!("{:?}", order.payment_method)
        );

        self.event_sender
            .send_or_log(Event::OrderCreated(order.id))
            .await;

        if let Some((code, reason)) = &placed.dropped_coupon {
            self.event_sender
                .send_or_log(Event::CouponDetached {
                    user_id: order.user_id,
                    code: code.clone(),
                    reason: reason.clone(),
                })
                .await;
        }

        inventory::publish_adjustments(
            &self.event_sender,
            &placed.order.stock_lines(),
            -1,
            "order_placed",
        )
        .await;

        let document = OrderDocument {
            order: order.clone(),
            items: placed.order.items.clone(),
        };
        self.notifier.order_confirmed(&document).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        commerce::{cart, cart_item, category, product_variant, DiscountType, ProductVariant},
        product, user, UserRole,
    };
    use rust_decimal_macros::dec;
    use sea_orm::{Database, DatabaseConnection};
    use sea_orm_migration::MigratorTrait;

    struct Fixture {
        db: DatabaseConnection,
        user: UserModel,
        coupon_id: Uuid,
        variant_id: Uuid,
    }

    /// One verified user with a single 1000 line in the cart and a fixed 100
    /// coupon limited to one use attached.
    async fn cart_with_capped_coupon() -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        crate::migrator::Migrator::up(&db, None).await.unwrap();
        let now = Utc::now();

        let category_id = Uuid::new_v4();
        category::ActiveModel {
            id: Set(category_id),
            name: Set("Shoes".into()),
            created_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let product_id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(product_id),
            name: Set("Loafer".into()),
            price: Set(dec!(1000)),
            category_id: Set(category_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let variant_id = Uuid::new_v4();
        product_variant::ActiveModel {
            id: Set(variant_id),
            product_id: Set(product_id),
            size: Set(Some("42".into())),
            color: Set(None),
            stock: Set(5),
            created_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let user = user::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Rafi".into()),
            email: Set("rafi@example.com".into()),
            contact_number: Set(None),
            address: Set(Some("Road 7, Dhaka".into())),
            country: Set(Some("BD".into())),
            is_verified: Set(true),
            role: Set(UserRole::Customer),
            created_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let coupon_id = Uuid::new_v4();
        coupon::ActiveModel {
            id: Set(coupon_id),
            code: Set("ONCE".into()),
            discount_type: Set(DiscountType::Fixed),
            value: Set(dec!(100)),
            max_discount: Set(None),
            min_order_amount: Set(None),
            total_usage_limit: Set(Some(1)),
            used_count: Set(0),
            expires_at: Set(None),
            is_stackable: Set(false),
            is_active: Set(true),
            created_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let cart_id = Uuid::new_v4();
        cart::ActiveModel {
            id: Set(cart_id),
            user_id: Set(user.id),
            coupon_code: Set(Some("ONCE".into())),
            total_amount: Set(dec!(1000)),
            discount_amount: Set(dec!(100)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart_id),
            variant_id: Set(variant_id),
            quantity: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        Fixture {
            db,
            user,
            coupon_id,
            variant_id,
        }
    }

    async fn used_count(db: &DatabaseConnection, coupon_id: Uuid) -> i32 {
        Coupon::find_by_id(coupon_id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .used_count
    }

    #[tokio::test]
    async fn commit_claims_the_coupon_use() {
        let fx = cart_with_capped_coupon().await;
        let txn = fx.db.begin().await.unwrap();

        let placed = commit_cart(
            &txn,
            &fx.user,
            Placement::CashOnDelivery,
            DiscountPolicy::default(),
        )
        .await
        .unwrap()
        .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(placed.order.order.coupon_code.as_deref(), Some("ONCE"));
        assert_eq!(placed.order.order.payable_amount, dec!(900));
        assert!(placed.dropped_coupon.is_none());
        assert_eq!(used_count(&fx.db, fx.coupon_id).await, 1);
    }

    #[tokio::test]
    async fn coupon_claimed_elsewhere_after_pricing_is_dropped() {
        let fx = cart_with_capped_coupon().await;
        let txn = fx.db.begin().await.unwrap();

        let priced = price_cart(&txn, fx.user.id, DiscountPolicy::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(priced.discount_amount, dec!(100));

        // Another checkout takes the last use between pricing and the claim.
        Coupon::update_many()
            .col_expr(coupon::Column::UsedCount, Expr::value(1))
            .filter(coupon::Column::Id.eq(fx.coupon_id))
            .exec(&txn)
            .await
            .unwrap();

        let placed = commit_priced(&txn, &fx.user, Placement::CashOnDelivery, priced)
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let order = &placed.order.order;
        assert_eq!(order.coupon_code, None);
        assert_eq!(order.discount_amount, Decimal::ZERO);
        assert_eq!(order.payable_amount, dec!(1000));
        assert_eq!(
            placed.dropped_coupon,
            Some(("ONCE".to_string(), "Coupon usage limit reached".to_string()))
        );
        assert_eq!(used_count(&fx.db, fx.coupon_id).await, 1);

        let stock = ProductVariant::find_by_id(fx.variant_id)
            .one(&fx.db)
            .await
            .unwrap()
            .unwrap()
            .stock;
        assert_eq!(stock, 4);
    }

    #[test]
    fn placement_snapshots_match_checkout_path() {
        assert_eq!(Placement::CashOnDelivery.method(), PaymentMethod::CashOnDelivery);
        assert_eq!(Placement::CashOnDelivery.payment_status(), PaymentStatus::AwaitingPayment);
        assert_eq!(Placement::CashOnDelivery.initial_status(), OrderStatus::Pending);
        assert_eq!(Placement::CashOnDelivery.payment_id(), None);

        let payment_id = Uuid::new_v4();
        let gateway = Placement::Gateway { payment_id };
        assert_eq!(gateway.method(), PaymentMethod::OnlinePayment);
        assert_eq!(gateway.payment_status(), PaymentStatus::Paid);
        assert_eq!(gateway.initial_status(), OrderStatus::Accepted);
        assert_eq!(gateway.payment_id(), Some(payment_id));
    }
}
