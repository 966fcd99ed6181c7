use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::{auth::AuthUser, errors::ServiceError, AppState};

pub fn owned_products_routes() -> Router<AppState> {
    Router::new().route("/mine", get(list_my_owned_products))
}

/// Products the caller currently owns
async fn list_my_owned_products(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> Result<Json<Value>, ServiceError> {
    let products = state
        .services
        .owned_products
        .owned_products(auth_user.user_id)
        .await?;
    Ok(Json(json!({ "count": products.len(), "products": products })))
}
