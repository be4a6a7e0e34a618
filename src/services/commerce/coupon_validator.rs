//! Coupon validation.
//!
//! Pure: callers load the coupon, its condition rows and the cart snapshot,
//! and own any persistence that follows from the verdict.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::commerce::{
    ConditionKind, ConditionOperator, CouponConditionModel, CouponModel, DiscountType,
};

/// One priced cart line as seen by the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLine {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub category_id: Uuid,
}

/// Cart state a coupon is checked against
#[derive(Debug, Clone, Default)]
pub struct CartSnapshot {
    pub total: Decimal,
    pub items: Vec<SnapshotLine>,
}

/// The customer redeeming the coupon
#[derive(Debug, Clone, Copy)]
pub struct CouponUser {
    pub id: Uuid,
    /// Orders already placed by this user
    pub prior_orders: u64,
}

/// Typed form of a stored `coupon_conditions` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponCondition {
    Category { ids: Vec<Uuid> },
    Product { ids: Vec<Uuid> },
    FirstOrder { required: bool },
}

impl CouponCondition {
    /// Decodes a stored row. `IN` rows carry a JSON id array, `EQ` rows a single id.
    pub fn decode(row: &CouponConditionModel) -> Result<Self, CouponRejection> {
        match row.kind {
            ConditionKind::Category => Ok(Self::Category {
                ids: decode_ids(row.operator, &row.value)?,
            }),
            ConditionKind::Product => Ok(Self::Product {
                ids: decode_ids(row.operator, &row.value)?,
            }),
            ConditionKind::FirstOrder => serde_json::from_str::<bool>(&row.value)
                .map(|required| Self::FirstOrder { required })
                .map_err(|_| CouponRejection::MalformedCondition),
        }
    }

    /// Storage form `(kind, operator, json value)` of this condition
    pub fn encode(&self) -> (ConditionKind, ConditionOperator, String) {
        match self {
            Self::Category { ids } => (
                ConditionKind::Category,
                ConditionOperator::In,
                ids_json(ids),
            ),
            Self::Product { ids } => (ConditionKind::Product, ConditionOperator::In, ids_json(ids)),
            Self::FirstOrder { required } => (
                ConditionKind::FirstOrder,
                ConditionOperator::Eq,
                required.to_string(),
            ),
        }
    }

    fn check(&self, cart: &CartSnapshot, user: &CouponUser) -> Result<(), CouponRejection> {
        match self {
            Self::Category { ids } => {
                if cart.items.iter().any(|line| ids.contains(&line.category_id)) {
                    Ok(())
                } else {
                    Err(CouponRejection::CategoryMismatch)
                }
            }
            Self::Product { ids } => {
                if cart.items.iter().any(|line| ids.contains(&line.product_id)) {
                    Ok(())
                } else {
                    Err(CouponRejection::ProductMismatch)
                }
            }
            Self::FirstOrder { required } => {
                if *required && user.prior_orders > 0 {
                    Err(CouponRejection::FirstOrderOnly)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn decode_ids(operator: ConditionOperator, raw: &str) -> Result<Vec<Uuid>, CouponRejection> {
    let ids = match operator {
        ConditionOperator::In => serde_json::from_str::<Vec<Uuid>>(raw),
        ConditionOperator::Eq => serde_json::from_str::<Uuid>(raw).map(|id| vec![id]),
    };
    ids.map_err(|_| CouponRejection::MalformedCondition)
}

fn ids_json(ids: &[Uuid]) -> String {
    serde_json::json!(ids).to_string()
}

/// Why a coupon does not apply. The display text is shown to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponRejection {
    #[error("Invalid coupon")]
    Invalid,
    #[error("Coupon expired")]
    Expired,
    #[error("Minimum order ৳{0} required")]
    BelowMinimum(Decimal),
    #[error("Coupon usage limit reached")]
    UsageLimitReached,
    #[error("Coupon not applicable for category")]
    CategoryMismatch,
    #[error("Coupon not applicable for product")]
    ProductMismatch,
    #[error("Only for first order")]
    FirstOrderOnly,
    #[error("Coupon condition is malformed")]
    MalformedCondition,
}

/// Accepted coupon with the discount it grants on the snapshot total
#[derive(Debug, Clone)]
pub struct CouponValidation {
    pub coupon: CouponModel,
    pub discount: Decimal,
}

/// Whether a discount is clamped to `[0, total]`
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscountPolicy {
    pub clamp_to_total: bool,
}

/// Runs the checks in order and stops at the first failure.
pub fn validate_coupon(
    coupon: Option<CouponModel>,
    conditions: &[CouponConditionModel],
    cart: &CartSnapshot,
    user: &CouponUser,
    now: DateTime<Utc>,
    policy: DiscountPolicy,
) -> Result<CouponValidation, CouponRejection> {
    let coupon = match coupon {
        Some(c) if c.is_active => c,
        _ => return Err(CouponRejection::Invalid),
    };

    if coupon.expires_at.map_or(false, |at| at < now) {
        return Err(CouponRejection::Expired);
    }

    if let Some(min) = coupon.min_order_amount {
        if cart.total < min {
            return Err(CouponRejection::BelowMinimum(min.normalize()));
        }
    }

    if let Some(limit) = coupon.total_usage_limit {
        if coupon.used_count >= limit {
            return Err(CouponRejection::UsageLimitReached);
        }
    }

    for row in conditions {
        CouponCondition::decode(row)?.check(cart, user)?;
    }

    let discount = compute_discount(&coupon, cart.total, policy);
    Ok(CouponValidation { coupon, discount })
}

/// Percent: `total * value / 100`. Fixed: `value`. Both capped by `max_discount`.
pub fn compute_discount(coupon: &CouponModel, total: Decimal, policy: DiscountPolicy) -> Decimal {
    let raw = match coupon.discount_type {
        DiscountType::Percent => (total * coupon.value / Decimal::ONE_HUNDRED).round_dp(2),
        DiscountType::Fixed => coupon.value,
    };

    let capped = match coupon.max_discount {
        Some(max) if raw > max => max,
        _ => raw,
    };

    if policy.clamp_to_total {
        capped.max(Decimal::ZERO).min(total.max(Decimal::ZERO))
    } else {
        capped
    }
}
