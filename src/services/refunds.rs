//! Refund requests against delivered orders.
//!
//! A request is created once per order by its owner and is then approved or
//! rejected by an admin exactly once. The damage photo is stored by the
//! upload service; only its location is kept here.

use crate::{
    entities::{
        order, refund_request, user, Order, OrderModel, OrderStatus, PaymentMethod, RefundRequest,
        RefundRequestModel, RefundStatus, User,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::Notifier,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const ALREADY_SUBMITTED: &str = "Refund request already submitted for this order";

/// Customer request to refund a delivered order
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRefundInput {
    pub order_id: Uuid,
    #[validate(length(max = 255))]
    pub reason: String,
    #[validate(length(max = 2000))]
    pub message: Option<String>,
    /// Where the upload service stored the damage photo
    pub image_url: Option<String>,
}

/// The parts of the order a refund listing shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundOrderSummary {
    pub id: Uuid,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub payment_method: PaymentMethod,
}

impl From<&OrderModel> for RefundOrderSummary {
    fn from(order: &OrderModel) -> Self {
        Self {
            id: order.id,
            status: order.status,
            total_amount: order.total_amount,
            payment_method: order.payment_method,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequester {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

/// A refund request with its order, and for admins its requester
#[derive(Debug, Clone, Serialize)]
pub struct RefundView {
    #[serde(flatten)]
    pub refund: RefundRequestModel,
    pub order: Option<RefundOrderSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<RefundRequester>,
}

fn refund_insert_error(err: DbErr) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::InvalidOperation(ALREADY_SUBMITTED.to_string())
        }
        _ => err.into(),
    }
}

fn required(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifier: Arc<Notifier>,
}

impl RefundService {
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

    /// Files a refund request for one of the caller's delivered orders.
    ///
    /// # Errors
    ///
    /// * `ValidationError` - missing reason or damage photo
    /// * `NotFound` - no such order
    /// * `Forbidden` - the order belongs to someone else
    /// * `InvalidOperation` - the order is not delivered, or already has a request
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn request_refund(
        &self,
        user_id: Uuid,
        input: CreateRefundInput,
    ) -> Result<RefundRequestModel, ServiceError> {
        input.validate()?;

        let image_url = required(input.image_url.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::ValidationError("Damage image is required".to_string())
            })?;
        let reason = required(Some(input.reason.as_str()))
            .map(str::to_string)
            .ok_or_else(|| ServiceError::ValidationError("Reason is required".to_string()))?;

        let order = Order::find_by_id(input.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;

        if order.user_id != user_id {
            warn!(order_id = %order.id, %user_id, "refund request by non-owner refused");
            return Err(ServiceError::Forbidden(
                "You cannot request a refund for this order".to_string(),
            ));
        }

        if order.status != OrderStatus::Delivered {
            return Err(ServiceError::InvalidOperation(
                "Refund allowed only for delivered orders".to_string(),
            ));
        }

        let existing = RefundRequest::find()
            .filter(refund_request::Column::OrderId.eq(order.id))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::InvalidOperation(ALREADY_SUBMITTED.to_string()));
        }

        let now = Utc::now();
        let refund = refund_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            order_id: Set(order.id),
            reason: Set(reason),
            message: Set(required(input.message.as_deref()).map(str::to_string)),
            image_url: Set(image_url),
            status: Set(RefundStatus::Requested),
            admin_note: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(refund_insert_error)?;

        info!(refund_id = %refund.id, order_id = %order.id, "refund requested");
        self.event_sender
            .send_or_log(Event::RefundRequested {
                refund_id: refund.id,
                order_id: order.id,
            })
            .await;
        self.notifier.refund_requested(&order).await;

        Ok(refund)
    }

    /// The caller's refund requests, newest first
    #[instrument(skip(self))]
    pub async fn my_refunds(&self, user_id: Uuid) -> Result<Vec<RefundView>, ServiceError> {
        let refunds = RefundRequest::find()
            .filter(refund_request::Column::UserId.eq(user_id))
            .order_by_desc(refund_request::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        self.views(refunds, false).await
    }

    /// Every refund request, newest first, optionally for one status
    #[instrument(skip(self))]
    pub async fn list_refunds(
        &self,
        status: Option<RefundStatus>,
    ) -> Result<Vec<RefundView>, ServiceError> {
        let mut select = RefundRequest::find().order_by_desc(refund_request::Column::CreatedAt);
        if let Some(status) = status {
            select = select.filter(refund_request::Column::Status.eq(status.to_value()));
        }
        let refunds = select.all(&*self.db).await?;

        self.views(refunds, true).await
    }

    pub async fn approve(&self, refund_id: Uuid) -> Result<RefundRequestModel, ServiceError> {
        self.decide(refund_id, RefundStatus::Approved, None).await
    }

    pub async fn reject(
        &self,
        refund_id: Uuid,
        admin_note: Option<String>,
    ) -> Result<RefundRequestModel, ServiceError> {
        let note = required(admin_note.as_deref()).map(str::to_string);
        self.decide(refund_id, RefundStatus::Rejected, note).await
    }

    /// Moves a REQUESTED refund to its final status. The update is
    /// conditional on the row still being REQUESTED, so two admins acting
    /// at once cannot both decide it.
    #[instrument(skip(self, admin_note))]
    async fn decide(
        &self,
        refund_id: Uuid,
        status: RefundStatus,
        admin_note: Option<String>,
    ) -> Result<RefundRequestModel, ServiceError> {
        let mut update = RefundRequest::update_many()
            .col_expr(refund_request::Column::Status, Expr::value(status.to_value()))
            .col_expr(refund_request::Column::UpdatedAt, Expr::value(Utc::now()));
        if admin_note.is_some() {
            update = update.col_expr(refund_request::Column::AdminNote, Expr::value(admin_note));
        }
        let result = update
            .filter(refund_request::Column::Id.eq(refund_id))
            .filter(refund_request::Column::Status.eq(RefundStatus::Requested.to_value()))
            .exec(&*self.db)
            .await?;

        let refund = RefundRequest::find_by_id(refund_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Refund request not found".to_string()))?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(
                "Refund request already processed".to_string(),
            ));
        }

        info!(%refund_id, %status, "refund decided");
        self.event_sender
            .send_or_log(Event::RefundDecided {
                refund_id,
                status: status.to_string(),
            })
            .await;

        match User::find_by_id(refund.user_id).one(&*self.db).await? {
            Some(requester) => {
                self.notifier
                    .refund_decided(&requester.email, &refund)
                    .await;
            }
            None => warn!(%refund_id, user_id = %refund.user_id, "requester gone; no email sent"),
        }

        Ok(refund)
    }

    async fn views(
        &self,
        refunds: Vec<RefundRequestModel>,
        with_requester: bool,
    ) -> Result<Vec<RefundView>, ServiceError> {
        if refunds.is_empty() {
            return Ok(Vec::new());
        }

        let order_ids: Vec<Uuid> = refunds.iter().map(|r| r.order_id).collect();
        let orders: HashMap<Uuid, OrderModel> = Order::find()
            .filter(order::Column::Id.is_in(order_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect();

        let requesters: HashMap<Uuid, RefundRequester> = if with_requester {
            let user_ids: Vec<Uuid> = refunds.iter().map(|r| r.user_id).collect();
            User::find()
                .filter(user::Column::Id.is_in(user_ids))
                .all(&*self.db)
                .await?
                .into_iter()
                .map(|u| {
                    (
                        u.id,
                        RefundRequester {
                            id: u.id,
                            name: u.name,
                            email: u.email,
                        },
                    )
                })
                .collect()
        } else {
            HashMap::new()
        };

        Ok(refunds
            .into_iter()
            .map(|refund| RefundView {
                order: orders.get(&refund.order_id).map(RefundOrderSummary::from),
                user: requesters.get(&refund.user_id).cloned(),
                refund,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn blank_optional_text_counts_as_missing() {
        assert_eq!(required(Some("  photo.jpg ")), Some("photo.jpg"));
        assert_eq!(required(Some("   ")), None);
        assert_eq!(required(None), None);
    }

    #[test]
    fn refund_status_parses_case_insensitively() {
        use std::str::FromStr;
        assert_eq!(RefundStatus::from_str("approved").unwrap(), RefundStatus::Approved);
        assert!(RefundStatus::from_str("REFUNDED").is_err());
    }

    #[test]
    fn non_unique_database_errors_pass_through() {
        assert_matches!(
            refund_insert_error(DbErr::Custom("disk full".into())),
            ServiceError::DatabaseError(_)
        );
    }
}
