//! Per-variant stock adjustments shared by both checkout paths and cancellation.
//!
//! Every change is a single conditional `UPDATE`, so callers get row-level
//! atomicity for free and can compose the adjustments into their own
//! transaction by passing it as the connection.

use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::commerce::{product_variant, ProductVariant},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Quantity of one variant to move in or out of stock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// Takes `quantity` units out of stock. Fails without touching the row when
/// fewer than `quantity` units remain.
#[instrument(skip(conn))]
pub async fn decrement<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(
            "Quantity must be at least 1".to_string(),
        ));
    }

    let result = ProductVariant::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).sub(quantity),
        )
        .filter(product_variant::Column::Id.eq(variant_id))
        .filter(product_variant::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(%variant_id, quantity, "stock decrement refused");
        return Err(ServiceError::InsufficientStock(format!(
            "Insufficient stock for variant {}",
            variant_id
        )));
    }

    debug!(%variant_id, quantity, "stock decremented");
    Ok(())
}

/// Puts `quantity` units back into stock.
#[instrument(skip(conn))]
pub async fn increment<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(
            "Quantity must be at least 1".to_string(),
        ));
    }

    let result = ProductVariant::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).add(quantity),
        )
        .filter(product_variant::Column::Id.eq(variant_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound("Variant not found".to_string()));
    }

    debug!(%variant_id, quantity, "stock incremented");
    Ok(())
}

/// Decrements every line. Lines are visited in variant id order so concurrent
/// checkouts lock rows in the same sequence.
pub async fn decrement_lines<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
) -> Result<(), ServiceError> {
    for line in sorted(lines) {
        decrement(conn, line.variant_id, line.quantity).await?;
    }
    Ok(())
}

/// Increments every line, in variant id order.
pub async fn increment_lines<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
) -> Result<(), ServiceError> {
    for line in sorted(lines) {
        increment(conn, line.variant_id, line.quantity).await?;
    }
    Ok(())
}

/// Publishes one `InventoryAdjusted` per line once the adjustment is committed.
pub async fn publish_adjustments(
    event_sender: &EventSender,
    lines: &[StockLine],
    sign: i32,
    reason: &str,
) {
    for line in lines {
        event_sender
            .send_or_log(Event::InventoryAdjusted {
                variant_id: line.variant_id,
                delta: sign * line.quantity,
                reason: reason.to_string(),
            })
            .await;
    }
}

fn sorted(lines: &[StockLine]) -> Vec<StockLine> {
    let mut ordered = lines.to_vec();
    ordered.sort_by_key(|line| line.variant_id);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::commerce::{category, product_variant};
    use crate::entities::product;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set, TransactionTrait};
    use sea_orm_migration::MigratorTrait;

    async fn setup(stock: i32) -> (DatabaseConnection, Uuid) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        crate::migrator::Migrator::up(&db, None).await.unwrap();

        let category_id = Uuid::new_v4();
        category::ActiveModel {
            id: Set(category_id),
            name: Set("Shirts".into()),
            created_at: Set(Utc::now()),
        }
        .insert(&db)
        .await
        .unwrap();

        let product_id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(product_id),
            name: Set("Oxford shirt".into()),
            price: Set(dec!(1200)),
            category_id: Set(category_id),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&db)
        .await
        .unwrap();

        let variant_id = Uuid::new_v4();
        product_variant::ActiveModel {
            id: Set(variant_id),
            product_id: Set(product_id),
            size: Set(Some("M".into())),
            color: Set(Some("Blue".into())),
            stock: Set(stock),
            created_at: Set(Utc::now()),
        }
        .insert(&db)
        .await
        .unwrap();

        (db, variant_id)
    }

    async fn stock_of(db: &DatabaseConnection, variant_id: Uuid) -> i32 {
        ProductVariant::find_by_id(variant_id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .stock
    }

    #[tokio::test]
    async fn decrement_never_goes_below_zero() {
        let (db, variant_id) = setup(3).await;

        decrement(&db, variant_id, 2).await.unwrap();
        assert_matches!(
            decrement(&db, variant_id, 2).await,
            Err(ServiceError::InsufficientStock(_))
        );
        assert_eq!(stock_of(&db, variant_id).await, 1);
    }

    #[tokio::test]
    async fn increment_restores_stock() {
        let (db, variant_id) = setup(0).await;
        increment(&db, variant_id, 4).await.unwrap();
        assert_eq!(stock_of(&db, variant_id).await, 4);
    }

    #[tokio::test]
    async fn failed_line_rolls_back_earlier_lines() {
        let (db, variant_id) = setup(5).await;
        let lines = [
            StockLine { variant_id, quantity: 2 },
            StockLine { variant_id: Uuid::new_v4(), quantity: 1 },
        ];

        let txn = db.begin().await.unwrap();
        let result = decrement_lines(&txn, &lines).await;
        assert!(result.is_err());
        txn.rollback().await.unwrap();

        assert_eq!(stock_of(&db, variant_id).await, 5);
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let (db, variant_id) = setup(5).await;
        assert_matches!(
            decrement(&db, variant_id, 0).await,
            Err(ServiceError::ValidationError(_))
        );
    }
}
