#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use storefront_orders::{
    app_router,
    auth::{Claims, Role},
    config::AppConfig,
    db,
    entities::{product, review},
    events::{self, EventSender},
    services::catalog::find_product,
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-secret-0123456789-abcdefghij";

/// Application harness backed by a throwaway SQLite file.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for sqlite");
        let db_path = db_dir.path().join("orders.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 8;
        cfg.db_min_connections = 1;
        cfg.retry_backoff_ms = 5;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let state = AppState::new(Arc::new(pool), cfg, EventSender::new(event_tx));

        Self {
            router: app_router(state.clone()),
            state,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid, role: Role) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            name: Some("Test User".to_string()),
            role,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// A fresh regular user and their bearer token.
    pub fn user(&self) -> (Uuid, String) {
        let id = Uuid::new_v4();
        (id, self.token_for(id, Role::User))
    }

    pub fn admin_token(&self) -> String {
        self.token_for(Uuid::new_v4(), Role::Admin)
    }

    /// Router handle that can move into a spawned task.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        send(self.router(), method, uri, body, token).await
    }

    pub async fn seed_product(&self, name: &str, price: i64, inventory: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(format!("{} for integration tests", name)),
            price: Set(Decimal::from(price)),
            category: Set("office".to_string()),
            company: Set("ikea".to_string()),
            inventory: Set(inventory),
            average_rating: Set(Decimal::ZERO),
            num_of_reviews: Set(0),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product for tests")
    }

    pub async fn inventory_of(&self, product_id: Uuid) -> i32 {
        find_product(&*self.state.db, product_id)
            .await
            .expect("product lookup")
            .expect("product exists")
            .inventory
    }

    pub async fn seed_review(&self, user_id: Uuid, product_id: Uuid) -> review::Model {
        review::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            user_name: Set("Test User".to_string()),
            product_id: Set(product_id),
            rating: Set(5),
            title: Set("great".to_string()),
            comment: Set("would buy again".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed review")
    }

    pub async fn owned_by(&self, user_id: Uuid) -> Vec<Uuid> {
        self.state
            .services
            .owned_products
            .owned_products(user_id)
            .await
            .expect("owned products")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn send(
    router: Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    token: Option<&str>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(tok) = token {
        builder = builder.header("authorization", format!("Bearer {}", tok));
    }

    let body = if let Some(json) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
    } else {
        Body::empty()
    };

    let request = builder.body(body).expect("failed to build request");
    router
        .oneshot(request)
        .await
        .expect("router error during test request")
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Reads a decimal that may have been serialized as a string or a number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected a decimal, got {other}"),
    }
}

pub fn order_body(items: &[(Uuid, i32)], tax: i64, shipping_fee: i64) -> Value {
    let cart: Vec<Value> = items
        .iter()
        .map(|(product, amount)| serde_json::json!({ "product": product, "amount": amount }))
        .collect();
    serde_json::json!({ "cartItems": cart, "tax": tax, "shippingFee": shipping_fee })
}
