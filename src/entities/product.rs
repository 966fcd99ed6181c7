use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_IMAGE: &str =
    "https://res.cloudinary.com/dwsodcnc4/image/upload/v1675717646/e-commerce-api/example_irjybr.svg";

pub const DEFAULT_INVENTORY: i32 = 100;

/// Catalog product. `inventory` is the live stock counter orders compete over.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[validate(length(
        min = 1,
        max = 100,
        message = "Product name must be between 1 and 100 characters"
    ))]
    pub name: String,

    #[validate(length(max = 1000, message = "Description cannot exceed 1000 characters"))]
    pub description: String,

    pub price: Decimal,
    pub image: String,
    pub category: String,
    pub company: String,

    /// Units in stock, never negative
    #[validate(range(min = 0))]
    pub inventory: i32,

    pub average_rating: Decimal,
    pub num_of_reviews: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::review::Entity")]
    Review,
}

impl Related<super::review::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Review.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
            if let ActiveValue::NotSet = active_model.image {
                active_model.image = Set(DEFAULT_IMAGE.to_string());
            }
            if let ActiveValue::NotSet = active_model.inventory {
                active_model.inventory = Set(DEFAULT_INVENTORY);
            }
        }
        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}
