use chrono::Utc;
use metrics::counter;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    auth::{check_permission, AuthUser},
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity},
        order_item::Model as OrderItemModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    middleware_helpers::retry::{with_retry, TransientErrorPolicy},
    services::{
        inventory::adjust_stock,
        locks::KeyedLocks,
        orders::{load_items, OrderPolicy, OrderView},
        owned_products::{apply_reconciliation, plan_reconciliation, OwnershipChange},
    },
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Delivered,
    Canceled,
    Failed,
}

impl OrderStatus {
    /// Paid and delivered orders justify owning their products
    pub fn grants_ownership(self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Delivered)
    }

    /// Stock stays taken out of the catalog while the order is in one of these states
    pub fn holds_stock(self) -> bool {
        !matches!(self, OrderStatus::Canceled | OrderStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryEffect {
    /// Return every line's amount to stock
    Restock,
    /// Take every line's amount out of stock again
    Reserve,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipAction {
    Grant,
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEffect {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub inventory: InventoryEffect,
    pub ownership: OwnershipAction,
}

impl fmt::Display for TransitionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Rules the transition table depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRules {
    pub allow_cancel_after_delivery: bool,
}

impl Default for TransitionRules {
    fn default() -> Self {
        Self {
            allow_cancel_after_delivery: true,
        }
    }
}

/// Looks up what moving an order from `from` to `to` does to stock and ownership.
pub fn transition_effect(
    from: OrderStatus,
    to: OrderStatus,
    rules: TransitionRules,
) -> Result<TransitionEffect, ServiceError> {
    if from == to {
        return Err(ServiceError::NoOpTransition(to.to_string()));
    }
    if to == OrderStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "Order cannot move from {} back to pending",
            from
        )));
    }
    if from == OrderStatus::Delivered && !to.holds_stock() && !rules.allow_cancel_after_delivery {
        return Err(ServiceError::InvalidTransition(format!(
            "Delivered orders cannot be marked {}",
            to
        )));
    }

    let inventory = match (from.holds_stock(), to.holds_stock()) {
        (true, false) => InventoryEffect::Restock,
        (false, true) => InventoryEffect::Reserve,
        _ => InventoryEffect::Unchanged,
    };
    let ownership = if to.grants_ownership() {
        OwnershipAction::Grant
    } else {
        OwnershipAction::Revoke
    };

    Ok(TransitionEffect {
        from,
        to,
        inventory,
        ownership,
    })
}

/// Request body for a status change. `status` defaults to `paid`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderStatus {
    pub status: Option<String>,
    pub payment_intent_id: Option<String>,
}

struct TransitionOutcome {
    order: OrderView,
    effect: TransitionEffect,
    ownership: OwnershipChange,
    changed_products: Vec<Uuid>,
}

/// Product ids of the line items, each once, in first-seen order.
fn distinct_products(items: &[OrderItemModel]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .map(|item| item.product_id)
        .filter(|id| seen.insert(*id))
        .collect()
}

#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    policy: OrderPolicy,
    locks: KeyedLocks,
}

impl OrderStatusService {
    pub fn new(db: Arc<DbPool>, event_sender: Option<Arc<EventSender>>, policy: OrderPolicy) -> Self {
        Self {
            db,
            event_sender,
            policy,
            locks: KeyedLocks::new(),
        }
    }

    fn rules(&self) -> TransitionRules {
        TransitionRules {
            allow_cancel_after_delivery: self.policy.allow_cancel_after_delivery,
        }
    }

    /// Moves an order to a new status and reconciles stock and ownership with it.
    #[instrument(skip(self, user, request), fields(caller = %user.user_id, order_id = %order_id))]
    pub async fn transition(
        &self,
        user: &AuthUser,
        order_id: Uuid,
        request: UpdateOrderStatus,
    ) -> Result<OrderView, ServiceError> {
        let owner = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No order found with id: {}", order_id)))?
            .user_id;
        check_permission(user, owner)?;

        let requested = request.status.as_deref().unwrap_or("paid");
        let target: OrderStatus = requested
            .parse()
            .map_err(|_| ServiceError::InvalidStatus(requested.to_string()))?;

        let outcome = {
            let _guard = self.locks.lock(owner).await;
            with_retry(&self.policy.retry, TransientErrorPolicy, || {
                self.transition_once(order_id, target, request.payment_intent_id.as_deref())
            })
            .await?
        };

        counter!("orders.status_transitions", 1);
        info!(transition = %outcome.effect, "Order status updated");
        self.emit(owner, &outcome).await;

        Ok(outcome.order)
    }

    async fn transition_once(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        payment_intent_id: Option<&str>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            ServiceError::DatabaseError(e)
        })?;

        // Write before reading so SQLite takes the write lock up front instead of
        // failing a read-to-write upgrade under contention
        OrderEntity::update_many()
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).into())
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;

        let current = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No order found with id: {}", order_id)))?;
        let from: OrderStatus = current.status.parse().map_err(|_| {
            ServiceError::InternalError(format!(
                "Order {} has unknown status {}",
                order_id, current.status
            ))
        })?;
        let effect = transition_effect(from, target, self.rules())?;

        let items = load_items(&txn, &current).await?;
        let product_ids = distinct_products(&items);

        // Review conflicts must surface before anything is written
        let ownership = plan_reconciliation(
            &txn,
            current.user_id,
            order_id,
            &product_ids,
            effect.ownership == OwnershipAction::Grant,
            &effect.to_string(),
        )
        .await?;

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(target.to_string()))
            .col_expr(order::Column::Version, Expr::col(order::Column::Version).add(1))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
        if let Some(payment_intent_id) = payment_intent_id {
            update = update.col_expr(
                order::Column::PaymentIntentId,
                Expr::value(payment_intent_id.to_string()),
            );
        }
        let updated = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(current.version))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let sign = match effect.inventory {
            InventoryEffect::Restock => 1,
            InventoryEffect::Reserve => -1,
            InventoryEffect::Unchanged => 0,
        };
        if sign != 0 {
            for item in &items {
                adjust_stock(&txn, item.product_id, sign * item.amount).await?;
            }
        }

        let changed_products =
            apply_reconciliation(&txn, current.user_id, order_id, &ownership).await?;

        let refreshed = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No order found with id: {}", order_id)))?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "Failed to commit status transition");
            ServiceError::DatabaseError(e)
        })?;

        let order = OrderView::from_parts(refreshed, items);
        Ok(TransitionOutcome {
            order,
            effect,
            ownership,
            changed_products,
        })
    }

    async fn emit(&self, owner: Uuid, outcome: &TransitionOutcome) {
        let Some(sender) = &self.event_sender else {
            return;
        };

        sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: outcome.order.id,
                old_status: outcome.effect.from.to_string(),
                new_status: outcome.effect.to.to_string(),
            })
            .await;

        let sign = match outcome.effect.inventory {
            InventoryEffect::Restock => 1,
            InventoryEffect::Reserve => -1,
            InventoryEffect::Unchanged => 0,
        };
        if sign != 0 {
            for item in &outcome.order.order_items {
                sender
                    .send_or_log(Event::InventoryAdjusted {
                        product_id: item.product,
                        delta: sign * item.amount,
                        order_id: outcome.order.id,
                    })
                    .await;
            }
        }

        if outcome.changed_products.is_empty() {
            return;
        }
        let product_ids = outcome.changed_products.clone();
        let event = match outcome.ownership {
            OwnershipChange::Grant(_) => Event::OwnershipGranted {
                user_id: owner,
                product_ids,
            },
            OwnershipChange::Revoke(_) => Event::OwnershipRevoked {
                user_id: owner,
                product_ids,
            },
        };
        sender.send_or_log(event).await;
    }
}
