// Catalog lookups the order engine prices against
pub mod catalog;

// Order engine
pub mod inventory;
pub mod order_status;
pub mod orders;
pub mod owned_products;
pub mod payments;

pub mod locks;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use sea_orm::{ActiveModelTrait, Set};
    use uuid::Uuid;

    use crate::{
        db::{establish_connection_with_config, run_migrations, DbConfig, DbPool},
        entities::{product, review},
    };

    /// Fresh migrated in-memory database. One connection, so every handle sees the same data.
    pub async fn memory_db() -> Arc<DbPool> {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("in-memory sqlite");
        run_migrations(&pool).await.expect("migrations");
        Arc::new(pool)
    }

    pub async fn seed_product(db: &DbPool, name: &str, price: i64, inventory: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(format!("{} description", name)),
            price: Set(Decimal::from(price)),
            category: Set("office".into()),
            company: Set("ikea".into()),
            inventory: Set(inventory),
            average_rating: Set(Decimal::ZERO),
            num_of_reviews: Set(0),
            ..Default::default()
        }
        .insert(db)
        .await
        .expect("seed product")
    }

    pub async fn inventory_of(db: &DbPool, product_id: Uuid) -> i32 {
        crate::services::catalog::find_product(db, product_id)
            .await
            .expect("product lookup")
            .expect("product exists")
            .inventory
    }

    pub async fn seed_review(db: &DbPool, user_id: Uuid, product_id: Uuid) -> review::Model {
        review::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            user_name: Set("Jo".into()),
            product_id: Set(product_id),
            rating: Set(4),
            title: Set("solid".into()),
            comment: Set("does the job".into()),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .expect("seed review")
    }
}
