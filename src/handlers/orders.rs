use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::{require_admin, AuthUser},
    errors::ServiceError,
    services::{
        order_status::UpdateOrderStatus,
        orders::{CreateOrderRequest, CreatedOrder},
    },
    AppState,
};

fn parse_order_id(id: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(id).map_err(|_| ServiceError::BadRequest(format!("Invalid order id: {}", id)))
}

/// Creates the router for order endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders).post(create_order))
        .route("/mine", get(list_my_orders))
        .route("/:id", get(get_order).patch(update_order))
}

/// Places an order for the caller
async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreatedOrder>), ServiceError> {
    let created = state
        .services
        .orders
        .create_order(auth_user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Lists every order. Admin only.
async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<Value>, ServiceError> {
    require_admin(&auth_user)?;
    let orders = state.services.orders.list_all().await?;
    Ok(Json(json!({ "count": orders.len(), "orders": orders })))
}

async fn list_my_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<Value>, ServiceError> {
    let orders = state
        .services
        .orders
        .list_for_user(auth_user.user_id)
        .await?;
    Ok(Json(json!({ "count": orders.len(), "orders": orders })))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth_user: AuthUser,
) -> Result<Json<Value>, ServiceError> {
    let order_id = parse_order_id(&id)?;
    let order = state.services.orders.get_order(&auth_user, order_id).await?;
    Ok(Json(json!({ "order": order })))
}

/// Drives the order through the lifecycle state machine
async fn update_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth_user: AuthUser,
    Json(request): Json<UpdateOrderStatus>,
) -> Result<Json<Value>, ServiceError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .services
        .order_status
        .transition(&auth_user, order_id, request)
        .await?;
    Ok(Json(json!({ "order": order })))
}
