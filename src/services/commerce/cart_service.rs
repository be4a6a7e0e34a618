use crate::{
    config::AppConfig,
    entities::{
        commerce::{
            cart, cart_item, coupon, coupon_condition, Cart, CartItem, CartModel, ConditionKind,
            Coupon, CouponConditionModel, CouponConditionRow, CouponModel, ProductVariant,
            ProductVariantModel,
        },
        order, Order, Product, ProductModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::commerce::coupon_validator::{
        validate_coupon, CartSnapshot, CouponRejection, CouponUser, DiscountPolicy, SnapshotLine,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Input for adding an item to the cart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddToCartInput {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// A cart line priced from the live product price
#[derive(Debug, Clone)]
pub struct PricedLine {
    pub item_id: Uuid,
    pub variant: ProductVariantModel,
    pub product: ProductModel,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Coupon dropped by a recomputation, with the reason it no longer applies
#[derive(Debug, Clone)]
pub struct DetachedCoupon {
    pub code: String,
    pub reason: CouponRejection,
}

/// Result of the single recomputation entry point
#[derive(Debug, Clone)]
pub struct PricedCart {
    pub cart: CartModel,
    pub lines: Vec<PricedLine>,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    /// The still-valid coupon, if one is attached
    pub coupon: Option<CouponModel>,
    pub detached: Option<DetachedCoupon>,
}

impl PricedCart {
    pub fn payable_amount(&self) -> Decimal {
        self.total_amount - self.discount_amount
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn snapshot(&self) -> CartSnapshot {
        snapshot_of(&self.lines, self.total_amount)
    }
}

fn snapshot_of(lines: &[PricedLine], total: Decimal) -> CartSnapshot {
    CartSnapshot {
        total,
        items: lines
            .iter()
            .map(|line| SnapshotLine {
                variant_id: line.variant.id,
                product_id: line.product.id,
                category_id: line.product.category_id,
            })
            .collect(),
    }
}

/// Cart line as returned to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLineView {
    pub item_id: Uuid,
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub size: Option<String>,
    pub color: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Cart as returned to the client; `payable_amount` is derived, never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartView {
    pub id: Option<Uuid>,
    pub items: Vec<CartLineView>,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub payable_amount: Decimal,
    pub coupon_code: Option<String>,
}

impl CartView {
    /// Sentinel for a user who has never added anything
    pub fn empty() -> Self {
        Self {
            id: None,
            items: Vec::new(),
            total_amount: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            payable_amount: Decimal::ZERO,
            coupon_code: None,
        }
    }
}

impl From<&PricedCart> for CartView {
    fn from(priced: &PricedCart) -> Self {
        Self {
            id: Some(priced.cart.id),
            items: priced
                .lines
                .iter()
                .map(|line| CartLineView {
                    item_id: line.item_id,
                    variant_id: line.variant.id,
                    product_id: line.product.id,
                    product_name: line.product.name.clone(),
                    size: line.variant.size.clone(),
                    color: line.variant.color.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    line_total: line.line_total,
                })
                .collect(),
            total_amount: priced.total_amount,
            discount_amount: priced.discount_amount,
            payable_amount: priced.payable_amount(),
            coupon_code: priced.coupon.as_ref().map(|c| c.code.clone()),
        }
    }
}

/// Loads a coupon by its (uppercase) code together with its condition rows.
pub(crate) async fn load_coupon<C: ConnectionTrait>(
    conn: &C,
    code: &str,
) -> Result<(Option<CouponModel>, Vec<CouponConditionModel>), ServiceError> {
    let coupon = Coupon::find()
        .filter(coupon::Column::Code.eq(code))
        .one(conn)
        .await?;

    let conditions = match &coupon {
        Some(c) => {
            c.find_related(CouponConditionRow)
                .order_by_asc(coupon_condition::Column::CreatedAt)
                .all(conn)
                .await?
        }
        None => Vec::new(),
    };

    Ok((coupon, conditions))
}

/// Builds the validator's view of the user. Orders are only counted when a
/// first-order condition needs them.
pub(crate) async fn coupon_user<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    conditions: &[CouponConditionModel],
) -> Result<CouponUser, ServiceError> {
    let prior_orders = if conditions
        .iter()
        .any(|c| c.kind == ConditionKind::FirstOrder)
    {
        Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .count(conn)
            .await?
    } else {
        0
    };

    Ok(CouponUser {
        id: user_id,
        prior_orders,
    })
}

/// Recomputes a user's cart from live prices and re-validates its coupon.
///
/// Returns `None` when the user has no cart. An attached coupon that no
/// longer validates is detached and reported in [`PricedCart::detached`].
/// Totals are persisted only when they changed, so repeated calls with no
/// intervening mutation leave the row and the output untouched.
pub async fn price_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    policy: DiscountPolicy,
) -> Result<Option<PricedCart>, ServiceError> {
    let Some(cart) = Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?
    else {
        return Ok(None);
    };

    let items = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .order_by_asc(cart_item::Column::Id)
        .all(conn)
        .await?;

    let variant_ids: Vec<Uuid> = items.iter().map(|item| item.variant_id).collect();
    let mut variants: HashMap<Uuid, (ProductVariantModel, Option<ProductModel>)> =
        if variant_ids.is_empty() {
            HashMap::new()
        } else {
            ProductVariant::find()
                .filter(crate::entities::commerce::product_variant::Column::Id.is_in(variant_ids))
                .find_also_related(Product)
                .all(conn)
                .await?
                .into_iter()
                .map(|(variant, product)| (variant.id, (variant, product)))
                .collect()
        };

    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        match variants.remove(&item.variant_id) {
            Some((variant, Some(product))) => {
                let unit_price = product.price;
                lines.push(PricedLine {
                    item_id: item.id,
                    line_total: unit_price * Decimal::from(item.quantity),
                    unit_price,
                    quantity: item.quantity,
                    variant,
                    product,
                });
            }
            _ => {
                warn!(item_id = %item.id, variant_id = %item.variant_id, "cart item without a priced variant skipped");
            }
        }
    }

    let total_amount: Decimal = lines.iter().map(|line| line.line_total).sum();

    let mut discount_amount = Decimal::ZERO;
    let mut valid_coupon = None;
    let mut detached = None;

    if let Some(code) = cart.coupon_code.clone() {
        let (coupon, conditions) = load_coupon(conn, &code).await?;
        let user = coupon_user(conn, user_id, &conditions).await?;
        let snapshot = snapshot_of(&lines, total_amount);

        match validate_coupon(coupon, &conditions, &snapshot, &user, Utc::now(), policy) {
            Ok(accepted) => {
                discount_amount = accepted.discount;
                valid_coupon = Some(accepted.coupon);
            }
            Err(reason) => {
                debug!(%user_id, %code, %reason, "detaching coupon");
                detached = Some(DetachedCoupon { code, reason });
            }
        }
    }

    let coupon_code = valid_coupon.as_ref().map(|c| c.code.clone());
    let cart = if cart.total_amount != total_amount
        || cart.discount_amount != discount_amount
        || cart.coupon_code != coupon_code
    {
        let mut active: cart::ActiveModel = cart.into();
        active.total_amount = Set(total_amount);
        active.discount_amount = Set(discount_amount);
        active.coupon_code = Set(coupon_code);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?
    } else {
        cart
    };

    Ok(Some(PricedCart {
        cart,
        lines,
        total_amount,
        discount_amount,
        coupon: valid_coupon,
        detached,
    }))
}

/// Empties a cart after checkout: items deleted, coupon detached, totals zeroed.
pub(crate) async fn clear_cart<C: ConnectionTrait>(
    conn: &C,
    cart: &CartModel,
) -> Result<(), ServiceError> {
    CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .exec(conn)
        .await?;

    let mut active: cart::ActiveModel = cart.clone().into();
    active.coupon_code = Set(None);
    active.total_amount = Set(Decimal::ZERO);
    active.discount_amount = Set(Decimal::ZERO);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;
    Ok(())
}

/// Shopping cart service: every mutation and every read ends in a full
/// recomputation, so the stored totals are always re-derived, never accumulated.
///
/// Concurrent recomputations for the same user are not serialized; the last
/// writer wins, which is harmless because nothing is accumulated.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing cart events
    /// * `config` - Application configuration (discount clamping policy)
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    pub fn discount_policy(&self) -> DiscountPolicy {
        DiscountPolicy {
            clamp_to_total: self.config.clamp_fixed_discount,
        }
    }

    /// Recomputes the user's cart and returns its view.
    ///
    /// An absent cart renders as [`CartView::empty`]. A coupon that no longer
    /// validates is detached silently; the caller only sees the zeroed discount.
    #[instrument(skip(self))]
    pub async fn recalculate(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let Some(priced) = price_cart(&*self.db, user_id, self.discount_policy()).await? else {
            return Ok(CartView::empty());
        };

        if let Some(detached) = &priced.detached {
            info!(%user_id, code = %detached.code, reason = %detached.reason, "coupon detached from cart");
            self.event_sender
                .send_or_log(Event::CouponDetached {
                    user_id,
                    code: detached.code.clone(),
                    reason: detached.reason.to_string(),
                })
                .await;
        }

        Ok(CartView::from(&priced))
    }

    /// Returns the freshly recomputed cart.
    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        self.recalculate(user_id).await
    }

    /// Adds a variant to the cart, creating the cart on first use.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Owner of the cart
    /// * `input` - Variant and quantity; an existing line for the same variant
    ///   has the quantity added to it
    ///
    /// # Returns
    ///
    /// * `Ok(CartView)` - Recomputed cart
    /// * `Err(ServiceError::ValidationError)` - Quantity below 1
    /// * `Err(ServiceError::NotFound)` - Variant does not exist
    /// * `Err(ServiceError::InsufficientStock)` - Resulting quantity exceeds stock
    #[instrument(skip(self))]
    pub async fn add_to_cart(
        &self,
        user_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartView, ServiceError> {
        if input.quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let variant = ProductVariant::find_by_id(input.variant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Variant not found".to_string()))?;

        let cart = self.get_or_create_cart(user_id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant.id))
            .one(&*self.db)
            .await?;

        let requested = existing
            .as_ref()
            .map_or(0, |item| item.quantity)
            .checked_add(input.quantity)
            .filter(|requested| *requested <= variant.stock)
            .ok_or_else(|| ServiceError::InsufficientStock("Insufficient stock".to_string()))?;

        let now = Utc::now();
        match existing {
            Some(item) => {
                let mut item: cart_item::ActiveModel = item.into();
                item.quantity = Set(requested);
                item.updated_at = Set(now);
                item.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    variant_id: Set(variant.id),
                    quantity: Set(requested),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;

        self.recalculate(user_id).await
    }

    /// Sets a line's quantity. Zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_cart_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Quantity cannot be negative".to_string(),
            ));
        }

        let item = self.find_owned_item(user_id, item_id).await?;

        if quantity == 0 {
            item.delete(&*self.db).await?;
        } else {
            let variant = ProductVariant::find_by_id(item.variant_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound("Variant not found".to_string()))?;

            if quantity > variant.stock {
                return Err(ServiceError::InsufficientStock(
                    "Insufficient stock".to_string(),
                ));
            }

            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(quantity);
            item.updated_at = Set(Utc::now());
            item.update(&*self.db).await?;
        }

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;

        self.recalculate(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_cart_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let item = self.find_owned_item(user_id, item_id).await?;
        item.delete(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartUpdated(user_id))
            .await;

        self.recalculate(user_id).await
    }

    /// Validates `code` against the current cart and attaches it.
    ///
    /// Unlike recomputation, a rejection here is surfaced to the caller with
    /// the validator's message.
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, user_id: Uuid, code: &str) -> Result<CartView, ServiceError> {
        let code = normalize_coupon_code(code)?;
        let policy = self.discount_policy();

        let priced = match price_cart(&*self.db, user_id, policy).await? {
            Some(priced) if !priced.is_empty() => priced,
            _ => return Err(ServiceError::NotFound("Cart is empty".to_string())),
        };

        let (coupon, conditions) = load_coupon(&*self.db, &code).await?;
        let user = coupon_user(&*self.db, user_id, &conditions).await?;
        let accepted = validate_coupon(
            coupon,
            &conditions,
            &priced.snapshot(),
            &user,
            Utc::now(),
            policy,
        )
        .map_err(|reason| ServiceError::ValidationError(reason.to_string()))?;

        let mut active: cart::ActiveModel = priced.cart.into();
        active.coupon_code = Set(Some(accepted.coupon.code.clone()));
        active.discount_amount = Set(accepted.discount);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;

        info!(%user_id, %code, discount = %accepted.discount, "coupon applied");
        self.event_sender
            .send_or_log(Event::CouponApplied {
                user_id,
                code,
                discount: accepted.discount,
            })
            .await;

        self.recalculate(user_id).await
    }

    /// Detaches the cart's coupon; a no-op when none is attached.
    #[instrument(skip(self))]
    pub async fn remove_coupon(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?;

        if let Some(cart) = cart {
            if let Some(code) = cart.coupon_code.clone() {
                let mut active: cart::ActiveModel = cart.into();
                active.coupon_code = Set(None);
                active.discount_amount = Set(Decimal::ZERO);
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;

                self.event_sender
                    .send_or_log(Event::CouponDetached {
                        user_id,
                        code,
                        reason: "removed by customer".to_string(),
                    })
                    .await;
            }
        }

        self.recalculate(user_id).await
    }

    async fn get_or_create_cart(&self, user_id: Uuid) -> Result<CartModel, ServiceError> {
        let now = Utc::now();
        let fresh = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            coupon_code: Set(None),
            total_amount: Set(Decimal::ZERO),
            discount_amount: Set(Decimal::ZERO),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // Two first adds may race; the unique user_id keeps a single cart.
        Cart::insert(fresh)
            .on_conflict(
                OnConflict::column(cart::Column::UserId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::InternalError("cart vanished after insert".to_string()))
    }

    async fn find_owned_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        let not_found = || ServiceError::NotFound("Cart item not found".to_string());

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(not_found)?;

        CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(&*self.db)
            .await?
            .ok_or_else(not_found)
    }
}

/// Trims and uppercases a customer-supplied coupon code.
pub fn normalize_coupon_code(raw: &str) -> Result<String, ServiceError> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() {
        return Err(ServiceError::ValidationError(
            "Coupon code is required".to_string(),
        ));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn coupon_code_is_trimmed_and_uppercased() {
        assert_eq!(normalize_coupon_code("  save10 ").unwrap(), "SAVE10");
        assert!(normalize_coupon_code("   ").is_err());
    }

    #[test]
    fn empty_view_has_zero_amounts() {
        let view = CartView::empty();
        assert!(view.items.is_empty());
        assert_eq!(view.total_amount, Decimal::ZERO);
        assert_eq!(view.payable_amount, Decimal::ZERO);
        assert!(view.coupon_code.is_none());
    }

    #[test]
    fn add_to_cart_input_deserializes() {
        let variant_id = Uuid::new_v4();
        let input: AddToCartInput = serde_json::from_value(serde_json::json!({
            "variant_id": variant_id,
            "quantity": 2
        }))
        .unwrap();
        assert_eq!(input.variant_id, variant_id);
        assert_eq!(input.quantity, 2);
    }

    #[test]
    fn payable_can_go_negative_without_clamping() {
        let now = Utc::now();
        let priced = PricedCart {
            cart: CartModel {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                coupon_code: Some("FLAT150".into()),
                total_amount: dec!(80),
                discount_amount: dec!(150),
                created_at: now,
                updated_at: now,
            },
            lines: Vec::new(),
            total_amount: dec!(80),
            discount_amount: dec!(150),
            coupon: None,
            detached: None,
        };
        assert_eq!(priced.payable_amount(), dec!(-70));
    }
}
