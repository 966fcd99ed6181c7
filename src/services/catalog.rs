use sea_orm::{ConnectionTrait, EntityTrait};
use tracing::error;
use uuid::Uuid;

use crate::{
    entities::product::{Entity as ProductEntity, Model as ProductModel},
    errors::ServiceError,
};

/// Looks up a product by id on any connection, including an open transaction.
pub async fn find_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Option<ProductModel>, ServiceError> {
    ProductEntity::find_by_id(product_id)
        .one(conn)
        .await
        .map_err(|e| {
            error!(%product_id, "Failed to fetch product: {}", e);
            ServiceError::DatabaseError(e)
        })
}
