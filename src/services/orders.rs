use crate::{
    entities::{order, order_item, Order, OrderItem, OrderItemModel, OrderModel, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::Notifier,
    services::inventory::{self, StockLine},
};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// An order together with its frozen lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

impl OrderWithItems {
    pub fn stock_lines(&self) -> Vec<StockLine> {
        stock_lines(&self.items)
    }
}

pub(crate) fn stock_lines(items: &[OrderItemModel]) -> Vec<StockLine> {
    items
        .iter()
        .map(|item| StockLine {
            variant_id: item.variant_id,
            quantity: item.quantity,
        })
        .collect()
}

/// Filters for the admin order listing
#[derive(Debug, Clone, Default)]
pub struct OrderListQuery {
    pub status: Option<OrderStatus>,
    pub page: u64,
    pub per_page: u64,
}

async fn attach_items<C: ConnectionTrait>(
    conn: &C,
    orders: Vec<OrderModel>,
) -> Result<Vec<OrderWithItems>, ServiceError> {
    if orders.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut grouped: HashMap<Uuid, Vec<OrderItemModel>> = HashMap::new();
    for item in OrderItem::find()
        .filter(order_item::Column::OrderId.is_in(ids))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?
    {
        grouped.entry(item.order_id).or_default().push(item);
    }

    Ok(orders
        .into_iter()
        .map(|order| {
            let items = grouped.remove(&order.id).unwrap_or_default();
            OrderWithItems { order, items }
        })
        .collect())
}

/// Service for reading orders and driving their lifecycle after placement
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifier: Arc<Notifier>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            event_sender,
            notifier,
        }
    }

    /// Fetches one order with its items
    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithItems, ServiceError> {
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        let mut found = attach_items(&*self.db, vec![order]).await?;
        found.pop().ok_or_else(|| {
            ServiceError::InternalError("order lost while loading items".to_string())
        })
    }

    /// The caller's orders, newest first
    #[instrument(skip(self))]
    pub async fn my_orders(&self, user_id: Uuid) -> Result<Vec<OrderWithItems>, ServiceError> {
        let orders = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        attach_items(&*self.db, orders).await
    }

    /// All orders, newest first, optionally filtered by status.
    ///
    /// Returns the page and the total number of matching orders.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        query: OrderListQuery,
    ) -> Result<(Vec<OrderWithItems>, u64), ServiceError> {
        let mut select = Order::find().order_by_desc(order::Column::CreatedAt);
        if let Some(status) = query.status {
            select = select.filter(order::Column::Status.eq(status.to_value()));
        }

        let paginator = select.paginate(&*self.db, query.per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(query.page.saturating_sub(1)).await?;

        Ok((attach_items(&*self.db, orders).await?, total))
    }

    /// Customer cancellation: only the placing user may cancel.
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderWithItems, ServiceError> {
        self.cancel(order_id, Some(user_id)).await
    }

    /// Admin status change. Cancelling goes through the same compensating
    /// workflow as a customer cancellation, minus the ownership check.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        let new_status = OrderStatus::from_str(status.trim())
            .map_err(|_| ServiceError::ValidationError("Invalid order status".to_string()))?;

        if new_status == OrderStatus::Cancelled {
            return self.cancel(order_id, None).await;
        }

        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(
                "Cancelled orders cannot change status".to_string(),
            ));
        }

        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status.to_value()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(order.status.to_value()))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "Order status changed concurrently".to_string(),
            ));
        }

        info!(%order_id, old = %order.status, new = %new_status, "order status updated");
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: order.status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        self.get_order(order_id).await
    }

    /// Terminates an order and puts its stock back.
    ///
    /// The status flip is conditional on the order still being cancellable,
    /// so of two racing cancellations only one restores stock.
    #[instrument(skip(self))]
    async fn cancel(
        &self,
        order_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if let Some(actor) = actor {
            if order.user_id != actor {
                warn!(%order_id, %actor, "cancellation by non-owner refused");
                return Err(ServiceError::Forbidden(
                    "You cannot cancel this order".to_string(),
                ));
            }
        }

        let not_cancellable =
            || ServiceError::ValidationError("Order cannot be cancelled at this stage".to_string());

        if !order.status.is_cancellable() {
            return Err(not_cancellable());
        }

        let flipped = Order::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Cancelled.to_value()),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(
                order::Column::Status
                    .is_in(OrderStatus::CANCELLABLE.iter().map(|s| s.to_value())),
            )
            .exec(&txn)
            .await?;

        if flipped.rows_affected == 0 {
            return Err(not_cancellable());
        }

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        let lines = stock_lines(&items);
        inventory::increment_lines(&txn, &lines).await?;

        txn.commit().await?;

        info!(%order_id, lines = lines.len(), "order cancelled and stock restored");
        metrics::increment_counter!("storefront_orders_cancelled_total");

        self.event_sender
            .send_or_log(Event::OrderCancelled(order_id))
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: order.status.to_string(),
                new_status: OrderStatus::Cancelled.to_string(),
            })
            .await;
        inventory::publish_adjustments(&self.event_sender, &lines, 1, "order_cancelled").await;

        let cancelled = self.get_order(order_id).await?;
        self.notifier.order_cancelled(&cancelled.order).await;

        Ok(cancelled)
    }
}
