//! Cart stock checks and atomic inventory adjustments.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::product::{self, Entity as ProductEntity, Model as ProductModel},
    errors::{InventoryIssue, InventoryIssues, ServiceError},
    services::catalog::find_product,
};

/// One line of a submitted cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product: Uuid,
    pub amount: i32,
}

/// Cart line that passed the stock check, with the catalog snapshot it will be sold at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedItem {
    pub product_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub image: String,
    pub amount: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedCart {
    pub accepted: Vec<AcceptedItem>,
    pub issues: InventoryIssues,
}

enum StockCheck {
    Sufficient,
    OutOfStock,
    NotEnough,
}

fn check_stock(inventory: i32, requested: i32) -> StockCheck {
    if inventory <= 0 {
        StockCheck::OutOfStock
    } else if inventory < requested {
        StockCheck::NotEnough
    } else {
        StockCheck::Sufficient
    }
}

fn issue_for(product: &ProductModel, requested: i32) -> InventoryIssue {
    InventoryIssue {
        product_id: product.id,
        name: product.name.clone(),
        requested_amount: requested,
        inventory: product.inventory,
    }
}

/// Shape checks that need no catalog access: non-empty, positive amounts, unique products.
fn check_cart_shape(items: &[CartItem]) -> Result<(), ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::BadRequest("No cart items provided".to_string()));
    }

    if let Some(item) = items.iter().find(|item| item.amount < 1) {
        return Err(ServiceError::ValidationError(format!(
            "Amount for product {} must be at least 1",
            item.product
        )));
    }

    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.product) {
            return Err(ServiceError::DuplicateCartItem(item.product));
        }
    }

    Ok(())
}

/// Looks up every cart line and sorts it into accepted items or stock issues.
///
/// A product that does not exist aborts the whole check with `NotFound`.
#[instrument(skip(conn, items), fields(lines = items.len()))]
pub async fn classify_cart<C: ConnectionTrait>(
    conn: &C,
    items: &[CartItem],
) -> Result<ValidatedCart, ServiceError> {
    check_cart_shape(items)?;

    let mut cart = ValidatedCart::default();
    for item in items {
        let product = find_product(conn, item.product).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("No product found with id: {}", item.product))
        })?;

        match check_stock(product.inventory, item.amount) {
            StockCheck::OutOfStock => cart.issues.out_of_stock.push(issue_for(&product, item.amount)),
            StockCheck::NotEnough => cart
                .issues
                .not_enough_inventory
                .push(issue_for(&product, item.amount)),
            StockCheck::Sufficient => cart.accepted.push(AcceptedItem {
                product_id: product.id,
                name: product.name,
                price: product.price,
                image: product.image,
                amount: item.amount,
            }),
        }
    }

    Ok(cart)
}

/// Validates a cart all-or-nothing: any stock issue rejects the whole submission.
pub async fn validate_cart<C: ConnectionTrait>(
    conn: &C,
    items: &[CartItem],
) -> Result<Vec<AcceptedItem>, ServiceError> {
    let cart = classify_cart(conn, items).await?;
    if !cart.issues.is_empty() {
        debug!(issues = cart.issues.len(), "cart rejected for stock");
        counter!("orders.inventory.rejected_carts", 1);
        return Err(ServiceError::InsufficientInventory(cart.issues));
    }
    Ok(cart.accepted)
}

/// Takes the write lock on the given product rows without changing them.
///
/// Run first inside a transaction that reads stock and then writes it. On
/// SQLite the transaction becomes the writer before its first read, so
/// concurrent checkouts queue on `busy_timeout` instead of failing the
/// read-to-write upgrade. On Postgres the rows stay locked until commit.
pub async fn lock_products<C: ConnectionTrait>(
    conn: &C,
    product_ids: &[Uuid],
) -> Result<(), ServiceError> {
    if product_ids.is_empty() {
        return Ok(());
    }

    ProductEntity::update_many()
        .col_expr(
            product::Column::Inventory,
            Expr::col(product::Column::Inventory).into(),
        )
        .filter(product::Column::Id.is_in(product_ids.iter().copied()))
        .exec(conn)
        .await?;
    Ok(())
}

/// Atomically moves a product's stock by `delta`, never below zero.
///
/// Decrements are conditional on enough stock being present at write time, so
/// two concurrent reservations cannot both succeed on the last unit.
pub async fn adjust_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    delta: i32,
) -> Result<(), ServiceError> {
    if delta == 0 {
        return Ok(());
    }

    let mut update = ProductEntity::update_many()
        .col_expr(
            product::Column::Inventory,
            Expr::col(product::Column::Inventory).add(delta),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(product_id));
    if delta < 0 {
        update = update.filter(product::Column::Inventory.gte(-delta));
    }

    let result = update.exec(conn).await?;
    if result.rows_affected > 0 {
        return Ok(());
    }

    match find_product(conn, product_id).await? {
        None => Err(ServiceError::NotFound(format!(
            "No product found with id: {}",
            product_id
        ))),
        Some(product) => {
            warn!(%product_id, delta, inventory = product.inventory, "stock reservation lost");
            counter!("orders.inventory.conflicts", 1);

            let requested = -delta;
            let mut issues = InventoryIssues::default();
            match check_stock(product.inventory, requested) {
                StockCheck::OutOfStock => issues.out_of_stock.push(issue_for(&product, requested)),
                _ => issues.not_enough_inventory.push(issue_for(&product, requested)),
            }
            Err(ServiceError::InsufficientInventory(issues))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{inventory_of, memory_db, seed_product};
    use assert_matches::assert_matches;

    fn line(product: Uuid, amount: i32) -> CartItem {
        CartItem { product, amount }
    }

    #[tokio::test]
    async fn accepts_cart_with_enough_stock() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;

        let accepted = validate_cart(&*db, &[line(lamp.id, 5)]).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].name, "lamp");
        assert_eq!(accepted[0].amount, 5);
    }

    #[tokio::test]
    async fn empty_cart_is_bad_request() {
        let db = memory_db().await;
        assert_matches!(
            validate_cart(&*db, &[]).await,
            Err(ServiceError::BadRequest(msg)) if msg == "No cart items provided"
        );
    }

    #[tokio::test]
    async fn zero_amount_is_rejected() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        assert_matches!(
            validate_cart(&*db, &[line(lamp.id, 0)]).await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[tokio::test]
    async fn duplicate_is_reported_before_missing_products() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 5).await;
        let ghost = Uuid::new_v4();

        let result = validate_cart(&*db, &[line(ghost, 1), line(lamp.id, 1), line(lamp.id, 2)]).await;
        assert_matches!(result, Err(ServiceError::DuplicateCartItem(id)) if id == lamp.id);
    }

    #[tokio::test]
    async fn missing_product_stops_validation() {
        let db = memory_db().await;
        let empty = seed_product(&db, "empty", 100, 0).await;
        let ghost = Uuid::new_v4();

        assert_matches!(
            validate_cart(&*db, &[line(ghost, 1), line(empty.id, 1)]).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn collects_every_stock_issue() {
        let db = memory_db().await;
        let empty = seed_product(&db, "empty", 100, 0).await;
        let short = seed_product(&db, "short", 100, 2).await;
        let plenty = seed_product(&db, "plenty", 100, 50).await;

        let cart = classify_cart(
            &*db,
            &[line(empty.id, 1), line(short.id, 3), line(plenty.id, 1)],
        )
        .await
        .unwrap();

        assert_eq!(cart.accepted.len(), 1);
        assert_eq!(cart.issues.out_of_stock[0].product_id, empty.id);
        assert_eq!(cart.issues.not_enough_inventory[0].inventory, 2);
        assert_eq!(cart.issues.not_enough_inventory[0].requested_amount, 3);

        assert_matches!(
            validate_cart(&*db, &[line(short.id, 3), line(plenty.id, 1)]).await,
            Err(ServiceError::InsufficientInventory(issues)) if issues.len() == 1
        );
    }

    #[tokio::test]
    async fn adjust_stock_never_goes_below_zero() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 3).await;

        adjust_stock(&*db, lamp.id, -2).await.unwrap();
        assert_eq!(inventory_of(&db, lamp.id).await, 1);

        assert_matches!(
            adjust_stock(&*db, lamp.id, -2).await,
            Err(ServiceError::InsufficientInventory(issues))
                if issues.not_enough_inventory.len() == 1
        );
        assert_eq!(inventory_of(&db, lamp.id).await, 1);

        adjust_stock(&*db, lamp.id, 4).await.unwrap();
        assert_eq!(inventory_of(&db, lamp.id).await, 5);
    }

    #[tokio::test]
    async fn adjust_stock_on_missing_product_is_not_found() {
        let db = memory_db().await;
        assert_matches!(
            adjust_stock(&*db, Uuid::new_v4(), 1).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn lock_products_leaves_stock_alone() {
        let db = memory_db().await;
        let lamp = seed_product(&db, "lamp", 2500, 3).await;

        lock_products(&*db, &[]).await.unwrap();
        lock_products(&*db, &[lamp.id, Uuid::new_v4()]).await.unwrap();
        assert_eq!(inventory_of(&db, lamp.id).await, 3);
    }
}
