use crate::{
    entities::commerce::{
        coupon, coupon_condition, Coupon, CouponConditionModel, CouponConditionRow, CouponModel,
        DiscountType,
    },
    errors::ServiceError,
    services::commerce::{cart_service::normalize_coupon_code, coupon_validator::CouponCondition},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_optional_positive(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

/// Admin request to create a coupon
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCouponInput {
    #[validate(length(max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[validate(custom = "validate_optional_positive")]
    pub max_discount: Option<Decimal>,
    #[validate(custom = "validate_optional_positive")]
    pub min_order_amount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub total_usage_limit: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_stackable: bool,
    #[serde(default)]
    pub conditions: Vec<CouponCondition>,
}

/// A coupon with its decoded conditions
#[derive(Debug, Clone, Serialize)]
pub struct CouponWithConditions {
    #[serde(flatten)]
    pub coupon: CouponModel,
    pub conditions: Vec<CouponCondition>,
}

/// A concurrent create can pass the existence check and lose on the unique
/// index instead; both report the same conflict.
fn coupon_insert_error(err: DbErr) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict("Coupon code already exists".to_string())
        }
        _ => err.into(),
    }
}

fn decode_conditions(rows: &[CouponConditionModel]) -> Vec<CouponCondition> {
    rows.iter()
        .filter_map(|row| CouponCondition::decode(row).ok())
        .collect()
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_coupon(
        &self,
        input: CreateCouponInput,
    ) -> Result<CouponWithConditions, ServiceError> {
        input.validate()?;

        let code = normalize_coupon_code(&input.code)?;

        if input.discount_value <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Discount value must be greater than 0".to_string(),
            ));
        }
        if input.discount_type == DiscountType::Percent
            && input.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ServiceError::ValidationError(
                "Percentage discount cannot exceed 100".to_string(),
            ));
        }

        let now = Utc::now();
        if matches!(input.expires_at, Some(expires_at) if expires_at <= now) {
            return Err(ServiceError::ValidationError(
                "Expiry date must be in the future".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let exists = Coupon::find()
            .filter(coupon::Column::Code.eq(code.as_str()))
            .one(&txn)
            .await?
            .is_some();
        if exists {
            return Err(ServiceError::Conflict("Coupon code already exists".to_string()));
        }

        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code),
            discount_type: Set(input.discount_type),
            value: Set(input.discount_value),
            max_discount: Set(input.max_discount),
            min_order_amount: Set(input.min_order_amount),
            total_usage_limit: Set(input.total_usage_limit),
            used_count: Set(0),
            expires_at: Set(input.expires_at),
            is_stackable: Set(input.is_stackable),
            is_active: Set(true),
            created_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(coupon_insert_error)?;

        for condition in &input.conditions {
            let (kind, operator, value) = condition.encode();
            coupon_condition::ActiveModel {
                id: Set(Uuid::new_v4()),
                coupon_id: Set(coupon.id),
                kind: Set(kind),
                operator: Set(operator),
                value: Set(value),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(
            coupon_id = %coupon.id,
            code = %coupon.code,
            conditions = input.conditions.len(),
            "coupon created"
        );
        Ok(CouponWithConditions {
            coupon,
            conditions: input.conditions,
        })
    }

    /// All coupons, newest first
    #[instrument(skip(self))]
    pub async fn list_coupons(&self) -> Result<Vec<CouponWithConditions>, ServiceError> {
        let coupons = Coupon::find()
            .order_by_desc(coupon::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let ids: Vec<Uuid> = coupons.iter().map(|c| c.id).collect();
        let mut grouped: HashMap<Uuid, Vec<CouponConditionModel>> = HashMap::new();
        if !ids.is_empty() {
            for row in CouponConditionRow::find()
                .filter(coupon_condition::Column::CouponId.is_in(ids))
                .all(&*self.db)
                .await?
            {
                grouped.entry(row.coupon_id).or_default().push(row);
            }
        }

        Ok(coupons
            .into_iter()
            .map(|coupon| {
                let rows = grouped.remove(&coupon.id).unwrap_or_default();
                CouponWithConditions {
                    conditions: decode_conditions(&rows),
                    coupon,
                }
            })
            .collect())
    }

    /// Soft delete: the coupon stops validating but stays on past orders.
    #[instrument(skip(self))]
    pub async fn deactivate_coupon(&self, coupon_id: Uuid) -> Result<CouponModel, ServiceError> {
        let coupon = Coupon::find_by_id(coupon_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        let mut active: coupon::ActiveModel = coupon.into();
        active.is_active = Set(false);
        let coupon = active.update(&*self.db).await?;

        info!(%coupon_id, code = %coupon.code, "coupon deactivated");
        Ok(coupon)
    }
}
