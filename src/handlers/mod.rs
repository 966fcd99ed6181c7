pub mod health;
pub mod orders;
pub mod owned_products;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        order_status::OrderStatusService,
        orders::{OrderPolicy, OrderService},
        owned_products::OwnedProductsService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub owned_products: Arc<OwnedProductsService>,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, config: &AppConfig) -> Self {
        let policy = OrderPolicy::from(config);

        Self {
            orders: Arc::new(OrderService::new(
                db_pool.clone(),
                Some(event_sender.clone()),
                policy.clone(),
            )),
            order_status: Arc::new(OrderStatusService::new(
                db_pool.clone(),
                Some(event_sender),
                policy,
            )),
            owned_products: Arc::new(OwnedProductsService::new(db_pool)),
        }
    }
}
