//! Per-user set of products the user legitimately owns.
//!
//! A product is owned iff at least one of the user's paid or delivered
//! orders references it. Grants are set-adds; revocations only remove
//! products that no other qualifying order still justifies.

use chrono::Utc;
use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{
        order::{self, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        owned_product::{self, Entity as OwnedProductEntity},
        review::{self, Entity as ReviewEntity},
    },
    errors::ServiceError,
    services::order_status::OrderStatus,
};

/// Ownership change derived from a status transition, computed before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipChange {
    Grant(Vec<Uuid>),
    Revoke(Vec<Uuid>),
}

/// Products of `product_ids` that another paid or delivered order of the user references.
async fn justified_elsewhere<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    excluding_order: Uuid,
    product_ids: &[Uuid],
) -> Result<HashSet<Uuid>, ServiceError> {
    let qualifying = [OrderStatus::Paid.to_string(), OrderStatus::Delivered.to_string()];

    let rows: Vec<Uuid> = OrderItemEntity::find()
        .select_only()
        .column(order_item::Column::ProductId)
        .inner_join(OrderEntity)
        .filter(order::Column::UserId.eq(user_id))
        .filter(order::Column::Id.ne(excluding_order))
        .filter(order::Column::Status.is_in(qualifying))
        .filter(order_item::Column::ProductId.is_in(product_ids.to_vec()))
        .into_tuple()
        .all(conn)
        .await?;

    Ok(rows.into_iter().collect())
}

async fn currently_owned<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    product_ids: Vec<Uuid>,
) -> Result<Vec<Uuid>, ServiceError> {
    Ok(OwnedProductEntity::find()
        .select_only()
        .column(owned_product::Column::ProductId)
        .filter(owned_product::Column::UserId.eq(user_id))
        .filter(owned_product::Column::ProductId.is_in(product_ids))
        .into_tuple()
        .all(conn)
        .await?)
}

/// Products that leave the user's set when `order_id` stops justifying ownership.
///
/// Fails with `ReviewConflict` when the user has reviewed any of them; nothing
/// is written either way.
#[instrument(skip(conn, product_ids), fields(products = product_ids.len()))]
pub async fn revocation_set<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    product_ids: &[Uuid],
    transition: &str,
) -> Result<Vec<Uuid>, ServiceError> {
    if product_ids.is_empty() {
        return Ok(Vec::new());
    }

    let justified = justified_elsewhere(conn, user_id, order_id, product_ids).await?;
    let candidates: Vec<Uuid> = product_ids
        .iter()
        .copied()
        .filter(|id| !justified.contains(id))
        .collect();
    if candidates.is_empty() {
        debug!("every product is still owned through another order");
        return Ok(Vec::new());
    }

    let revoked = currently_owned(conn, user_id, candidates).await?;
    if revoked.is_empty() {
        return Ok(revoked);
    }

    let review_ids: Vec<Uuid> = ReviewEntity::find()
        .select_only()
        .column(review::Column::Id)
        .filter(review::Column::UserId.eq(user_id))
        .filter(review::Column::ProductId.is_in(revoked.clone()))
        .order_by_asc(review::Column::CreatedAt)
        .into_tuple()
        .all(conn)
        .await?;
    if !review_ids.is_empty() {
        warn!(reviews = review_ids.len(), %transition, "revocation blocked by reviews");
        return Err(ServiceError::ReviewConflict {
            review_ids,
            transition: transition.to_string(),
        });
    }

    Ok(revoked)
}

/// Works out the ownership change for an order without writing anything.
pub async fn plan_reconciliation<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    product_ids: &[Uuid],
    grant: bool,
    transition: &str,
) -> Result<OwnershipChange, ServiceError> {
    if grant {
        Ok(OwnershipChange::Grant(product_ids.to_vec()))
    } else {
        revocation_set(conn, user_id, order_id, product_ids, transition)
            .await
            .map(OwnershipChange::Revoke)
    }
}

/// Applies a planned change. Returns the products whose membership actually changed.
pub async fn apply_reconciliation<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    order_id: Uuid,
    change: &OwnershipChange,
) -> Result<Vec<Uuid>, ServiceError> {
    match change {
        OwnershipChange::Grant(product_ids) => {
            let mut added = Vec::new();
            for product_id in product_ids {
                let inserted = OwnedProductEntity::insert(owned_product::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    product_id: Set(*product_id),
                    granted_by_order: Set(order_id),
                    created_at: Set(Utc::now()),
                })
                .on_conflict(
                    OnConflict::columns([
                        owned_product::Column::UserId,
                        owned_product::Column::ProductId,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(conn)
                .await?;
                if inserted > 0 {
                    added.push(*product_id);
                }
            }
            Ok(added)
        }
        OwnershipChange::Revoke(product_ids) => {
            if product_ids.is_empty() {
                return Ok(Vec::new());
            }
            OwnedProductEntity::delete_many()
                .filter(owned_product::Column::UserId.eq(user_id))
                .filter(owned_product::Column::ProductId.is_in(product_ids.clone()))
                .exec(conn)
                .await?;
            Ok(product_ids.clone())
        }
    }
}

/// Read access to users' owned-product sets
#[derive(Clone)]
pub struct OwnedProductsService {
    db: Arc<DbPool>,
}

impl OwnedProductsService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Product ids the user currently owns, oldest grant first.
    #[instrument(skip(self))]
    pub async fn owned_products(&self, user_id: Uuid) -> Result<Vec<Uuid>, ServiceError> {
        Ok(OwnedProductEntity::find()
            .select_only()
            .column(owned_product::Column::ProductId)
            .filter(owned_product::Column::UserId.eq(user_id))
            .order_by_asc(owned_product::Column::CreatedAt)
            .into_tuple()
            .all(&*self.db)
            .await?)
    }
}
