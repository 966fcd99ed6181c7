use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    auth::{check_permission, AuthUser},
    config::AppConfig,
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel},
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    middleware_helpers::retry::{with_retry, RetryConfig, TransientErrorPolicy},
    services::{
        inventory::{adjust_stock, lock_products, validate_cart, AcceptedItem, CartItem},
        order_status::OrderStatus,
        payments::{convert, Currency, PaymentIntent},
    },
};

/// Order-engine settings taken from the application config.
#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub payment_currency: String,
    pub require_tax_and_shipping: bool,
    pub allow_cancel_after_delivery: bool,
    pub retry: RetryConfig,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            payment_currency: Currency::Ils.to_string(),
            require_tax_and_shipping: true,
            allow_cancel_after_delivery: true,
            retry: RetryConfig::default(),
        }
    }
}

impl From<&AppConfig> for OrderPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            payment_currency: cfg.payment_currency.clone(),
            require_tax_and_shipping: cfg.require_tax_and_shipping,
            allow_cancel_after_delivery: cfg.allow_cancel_after_delivery,
            retry: cfg.retry_config(),
        }
    }
}

/// Request body for placing an order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    pub cart_items: Vec<CartItem>,
    pub tax: Option<Decimal>,
    pub shipping_fee: Option<Decimal>,
}

/// Priced line of an order that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftLine {
    pub product_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub image: String,
    pub amount: i32,
}

/// Result of assembling validated cart lines into an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub lines: Vec<DraftLine>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_fee: Decimal,
    /// `tax + shipping_fee + subtotal`, or zero when that sum is not computable
    pub total: Decimal,
}

/// Builds the order lines and totals from accepted cart items.
///
/// A missing tax or shipping fee, or a total that overflows, yields a zero
/// total rather than an error. Only an overflowing subtotal is rejected.
pub fn assemble_order(
    accepted: Vec<AcceptedItem>,
    tax: Option<Decimal>,
    shipping_fee: Option<Decimal>,
) -> Result<OrderDraft, ServiceError> {
    let too_large = || ServiceError::ValidationError("Order subtotal is too large".to_string());

    let mut subtotal = Decimal::ZERO;
    let mut lines = Vec::with_capacity(accepted.len());
    for item in accepted {
        let line_total = item
            .price
            .checked_mul(Decimal::from(item.amount))
            .ok_or_else(too_large)?;
        subtotal = subtotal.checked_add(line_total).ok_or_else(too_large)?;

        lines.push(DraftLine {
            product_id: item.product_id,
            name: item.name,
            price: item.price,
            image: item.image,
            amount: item.amount,
        });
    }

    let total = match (tax, shipping_fee) {
        (Some(tax), Some(shipping)) => tax
            .checked_add(shipping)
            .and_then(|sum| sum.checked_add(subtotal))
            .unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    };

    Ok(OrderDraft {
        lines,
        subtotal,
        tax: tax.unwrap_or(Decimal::ZERO),
        shipping_fee: shipping_fee.unwrap_or(Decimal::ZERO),
        total,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product: Uuid,
    pub name: String,
    pub price: Decimal,
    pub image: String,
    pub amount: i32,
}

/// Order as returned over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub user: Uuid,
    pub order_items: Vec<OrderItemView>,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping_fee: Decimal,
    pub total: Decimal,
    pub status: String,
    pub client_secret: String,
    pub payment_intent_id: Option<String>,
    pub currency: String,
    pub converted_total: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderView {
    pub fn from_parts(order: OrderModel, mut items: Vec<OrderItemModel>) -> Self {
        items.sort_by_key(|item| item.position);
        Self {
            id: order.id,
            user: order.user_id,
            order_items: items
                .into_iter()
                .map(|item| OrderItemView {
                    product: item.product_id,
                    name: item.name,
                    price: item.price,
                    image: item.image,
                    amount: item.amount,
                })
                .collect(),
            subtotal: order.subtotal,
            tax: order.tax,
            shipping_fee: order.shipping_fee,
            total: order.total,
            status: order.status,
            client_secret: order.client_secret,
            payment_intent_id: order.payment_intent_id,
            currency: order.currency,
            converted_total: order.converted_total,
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Response for a newly placed order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order: OrderView,
    pub client_secret: String,
    pub currency: Currency,
    pub converted_total: Decimal,
}

/// Loads an order's line items in cart order.
pub(crate) async fn load_items<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
) -> Result<Vec<OrderItemModel>, ServiceError> {
    order
        .find_related(OrderItemEntity)
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

/// Service for placing and reading orders
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    policy: OrderPolicy,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: Option<Arc<EventSender>>, policy: OrderPolicy) -> Self {
        Self {
            db,
            event_sender,
            policy,
        }
    }

    /// Places an order for `user_id`: validates the cart, prices it, simulates
    /// the payment intent and reserves stock, all in one transaction.
    #[instrument(skip(self, request), fields(user_id = %user_id, lines = request.cart_items.len()))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<CreatedOrder, ServiceError> {
        self.check_charges(&request)?;

        let (order, items, intent) = with_retry(&self.policy.retry, TransientErrorPolicy, || {
            self.create_order_once(user_id, &request)
        })
        .await?;

        counter!("orders.created", 1);
        info!(order_id = %order.id, total = %order.total, "Order created");

        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::OrderCreated {
                    order_id: order.id,
                    user_id,
                })
                .await;
            for item in &items {
                sender
                    .send_or_log(Event::InventoryAdjusted {
                        product_id: item.product_id,
                        delta: -item.amount,
                        order_id: order.id,
                    })
                    .await;
            }
        }

        Ok(CreatedOrder {
            client_secret: order.client_secret.clone(),
            currency: intent.currency,
            converted_total: intent.converted_amount,
            order: OrderView::from_parts(order, items),
        })
    }

    fn check_charges(&self, request: &CreateOrderRequest) -> Result<(), ServiceError> {
        if self.policy.require_tax_and_shipping
            && (request.tax.is_none() || request.shipping_fee.is_none())
        {
            return Err(ServiceError::ValidationError(
                "Please provide tax and shipping fee".to_string(),
            ));
        }

        let negative = |value: Option<Decimal>| value.map_or(false, |v| v < Decimal::ZERO);
        if negative(request.tax) || negative(request.shipping_fee) {
            return Err(ServiceError::ValidationError(
                "Tax and shipping fee cannot be negative".to_string(),
            ));
        }

        Ok(())
    }

    async fn create_order_once(
        &self,
        user_id: Uuid,
        request: &CreateOrderRequest,
    ) -> Result<(OrderModel, Vec<OrderItemModel>, PaymentIntent), ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let product_ids: Vec<Uuid> = request.cart_items.iter().map(|item| item.product).collect();
        lock_products(&txn, &product_ids).await?;

        let accepted = validate_cart(&txn, &request.cart_items).await?;
        let draft = assemble_order(accepted, request.tax, request.shipping_fee)?;
        let intent = convert(draft.total, &self.policy.payment_currency)?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            subtotal: Set(draft.subtotal),
            tax: Set(draft.tax),
            shipping_fee: Set(draft.shipping_fee),
            total: Set(draft.total),
            status: Set(OrderStatus::Pending.to_string()),
            client_secret: Set(intent.reference.clone()),
            payment_intent_id: Set(None),
            currency: Set(intent.currency.to_string()),
            converted_total: Set(intent.converted_amount),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, %order_id, "Failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(draft.lines.len());
        for (position, line) in draft.lines.iter().enumerate() {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                product_id: Set(line.product_id),
                name: Set(line.name.clone()),
                price: Set(line.price),
                image: Set(line.image.clone()),
                amount: Set(line.amount),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        // A lost race on any line rolls back the whole order
        for line in &draft.lines {
            adjust_stock(&txn, line.product_id, -line.amount).await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        Ok((order, items, intent))
    }

    /// Every order in the system. Empty is reported as `NotFound`.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<OrderView>, ServiceError> {
        let orders = self.list_where(None).await?;
        if orders.is_empty() {
            return Err(ServiceError::NotFound("There are no orders right now".to_string()));
        }
        Ok(orders)
    }

    #[instrument(skip(self))]
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OrderView>, ServiceError> {
        let orders = self.list_where(Some(user_id)).await?;
        if orders.is_empty() {
            return Err(ServiceError::NotFound("No orders".to_string()));
        }
        Ok(orders)
    }

    async fn list_where(&self, user_id: Option<Uuid>) -> Result<Vec<OrderView>, ServiceError> {
        let mut query = OrderEntity::find();
        if let Some(user_id) = user_id {
            query = query.filter(order::Column::UserId.eq(user_id));
        }

        let mut rows = query
            .find_with_related(OrderItemEntity)
            .all(&*self.db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to list orders");
                ServiceError::DatabaseError(e)
            })?;
        rows.sort_by(|(a, _), (b, _)| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(rows
            .into_iter()
            .map(|(order, items)| OrderView::from_parts(order, items))
            .collect())
    }

    /// Fetches one order, visible only to its owner or an admin.
    #[instrument(skip(self, user), fields(caller = %user.user_id))]
    pub async fn get_order(&self, user: &AuthUser, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No order found with id: {}", order_id)))?;

        check_permission(user, order.user_id)?;

        let items = load_items(&*self.db, &order).await?;
        Ok(OrderView::from_parts(order, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::services::test_support::{inventory_of, memory_db, seed_product};
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn accepted(price: Decimal, amount: i32) -> AcceptedItem {
        AcceptedItem {
            product_id: Uuid::new_v4(),
            name: "item".into(),
            price,
            image: "img".into(),
            amount,
        }
    }

    fn buyer(user_id: Uuid) -> AuthUser {
        AuthUser {
            user_id,
            name: None,
            role: Role::User,
        }
    }

    #[test]
    fn assembles_totals() {
        let draft = assemble_order(
            vec![accepted(dec!(2500), 2), accepted(dec!(1000), 1)],
            Some(dec!(499)),
            Some(dec!(799)),
        )
        .unwrap();

        assert_eq!(draft.subtotal, dec!(6000));
        assert_eq!(draft.total, dec!(7298));
        assert_eq!(draft.lines.len(), 2);
    }

    #[test]
    fn missing_addend_zeroes_total() {
        let draft = assemble_order(vec![accepted(dec!(2500), 1)], None, Some(dec!(799))).unwrap();
        assert_eq!(draft.subtotal, dec!(2500));
        assert_eq!(draft.total, Decimal::ZERO);
        assert_eq!(draft.tax, Decimal::ZERO);
    }

    #[test]
    fn overflowing_subtotal_is_rejected() {
        assert_matches!(
            assemble_order(vec![accepted(Decimal::MAX, 2)], Some(dec!(1)), Some(dec!(1))),
            Err(ServiceError::ValidationError(_))
        );
    }

    proptest! {
        #[test]
        fn subtotal_is_sum_of_lines(lines in prop::collection::vec((0i64..100_000, 1i32..50), 1..8)) {
            let items: Vec<_> = lines
                .iter()
                .map(|(price, amount)| accepted(Decimal::from(*price), *amount))
                .collect();
            let expected: i64 = lines.iter().map(|(price, amount)| price * (*amount as i64)).sum();

            let draft = assemble_order(items, Some(dec!(10)), Some(dec!(5))).unwrap();
            prop_assert_eq!(draft.subtotal, Decimal::from(expected));
            prop_assert_eq!(draft.total, Decimal::from(expected + 15));
        }
    }

    #[tokio::test]
    async fn create_order_reserves_stock_and_snapshots_lines() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        let service = OrderService::new(db.clone(), None, OrderPolicy::default());
        let user_id = Uuid::new_v4();

        let created = service
            .create_order(
                user_id,
                CreateOrderRequest {
                    cart_items: vec![CartItem {
                        product: lamp.id,
                        amount: 2,
                    }],
                    tax: Some(dec!(499)),
                    shipping_fee: Some(dec!(799)),
                },
            )
            .await
            .unwrap();

        assert_eq!(created.order.status, "pending");
        assert_eq!(created.order.total, dec!(6298));
        assert_eq!(created.order.order_items[0].name, "lamp");
        assert_eq!(created.client_secret, created.order.client_secret);
        assert_eq!(created.currency, Currency::Ils);

        assert_eq!(inventory_of(&db, lamp.id).await, 3);

        let fetched = service.get_order(&buyer(user_id), created.order.id).await.unwrap();
        assert_eq!(fetched.order_items.len(), 1);
        assert_eq!(service.list_for_user(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_charges_are_rejected_by_default() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        let service = OrderService::new(db.clone(), None, OrderPolicy::default());

        let result = service
            .create_order(
                Uuid::new_v4(),
                CreateOrderRequest {
                    cart_items: vec![CartItem {
                        product: lamp.id,
                        amount: 1,
                    }],
                    tax: None,
                    shipping_fee: Some(dec!(1)),
                },
            )
            .await;
        assert_matches!(result, Err(ServiceError::ValidationError(_)));

        assert_eq!(inventory_of(&db, lamp.id).await, 5);
    }

    #[tokio::test]
    async fn lenient_policy_zeroes_total() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        let policy = OrderPolicy {
            require_tax_and_shipping: false,
            ..OrderPolicy::default()
        };
        let service = OrderService::new(db, None, policy);

        let created = service
            .create_order(
                Uuid::new_v4(),
                CreateOrderRequest {
                    cart_items: vec![CartItem {
                        product: lamp.id,
                        amount: 1,
                    }],
                    tax: Some(dec!(100)),
                    shipping_fee: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(created.order.total, Decimal::ZERO);
        assert_eq!(created.converted_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn other_users_cannot_read_an_order() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        let service = OrderService::new(db, None, OrderPolicy::default());
        let owner = Uuid::new_v4();

        let created = service
            .create_order(
                owner,
                CreateOrderRequest {
                    cart_items: vec![CartItem {
                        product: lamp.id,
                        amount: 1,
                    }],
                    tax: Some(dec!(0)),
                    shipping_fee: Some(dec!(0)),
                },
            )
            .await
            .unwrap();

        assert_matches!(
            service.get_order(&buyer(Uuid::new_v4()), created.order.id).await,
            Err(ServiceError::Forbidden(_))
        );
        assert_matches!(
            service.get_order(&buyer(owner), Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );
        assert_matches!(
            service.list_for_user(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );
    }
}
