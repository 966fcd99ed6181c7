mod common;

use axum::http::{Method, StatusCode};
use common::{order_body, response_json, TestApp};
use serde_json::json;
use storefront_orders::auth::Role;
use uuid::Uuid;

async fn place_order(app: &TestApp, token: &str, product_id: Uuid) -> String {
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(&[(product_id, 1)], 0, 0)),
            Some(token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await["order"]["id"]
        .as_str()
        .expect("order id")
        .to_string()
}

#[tokio::test]
async fn order_routes_require_a_token() {
    let app = TestApp::new().await;

    for (method, uri) in [
        (Method::GET, "/api/v1/orders".to_string()),
        (Method::GET, "/api/v1/orders/mine".to_string()),
        (Method::GET, format!("/api/v1/orders/{}", Uuid::new_v4())),
        (Method::GET, "/api/v1/owned-products/mine".to_string()),
    ] {
        let response = app.request(method, &uri, None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
    }
}

#[tokio::test]
async fn tokens_signed_with_another_secret_are_rejected() {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use storefront_orders::auth::Claims;

    let app = TestApp::new().await;
    let now = Utc::now();
    let forged = encode(
        &Header::default(),
        &Claims {
            sub: Uuid::new_v4().to_string(),
            name: None,
            role: Role::Admin,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        },
        &EncodingKey::from_secret(b"some-other-secret-that-is-long-enough"),
    )
    .unwrap();

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some(&forged))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn users_only_see_their_own_orders() {
    let app = TestApp::new().await;
    let (_, owner_token) = app.user();
    let (_, stranger_token) = app.user();
    let lamp = app.seed_product("lamp", 2500, 5).await;
    let order_id = place_order(&app, &owner_token, lamp.id).await;
    let uri = format!("/api/v1/orders/{}", order_id);

    let response = app.request(Method::GET, &uri, None, Some(&owner_token)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(Method::GET, &uri, None, Some(&stranger_token))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(Method::GET, &uri, None, Some(&app.admin_token()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mine = response_json(
        app.request(Method::GET, "/api/v1/orders/mine", None, Some(&owner_token))
            .await,
    )
    .await;
    assert_eq!(mine["count"], 1);
    assert_eq!(mine["orders"][0]["id"], order_id.as_str());

    let response = app
        .request(Method::GET, "/api/v1/orders/mine", None, Some(&stranger_token))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn strangers_cannot_change_an_order() {
    let app = TestApp::new().await;
    let (owner_id, owner_token) = app.user();
    let (_, stranger_token) = app.user();
    let lamp = app.seed_product("lamp", 2500, 5).await;
    let order_id = place_order(&app, &owner_token, lamp.id).await;

    let response = app
        .request(
            Method::PATCH,
            &format!("/api/v1/orders/{}", order_id),
            Some(json!({ "status": "canceled" })),
            Some(&stranger_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.inventory_of(lamp.id).await, 4);
    assert!(app.owned_by(owner_id).await.is_empty());
}

#[tokio::test]
async fn strangers_are_refused_before_the_status_is_read() {
    let app = TestApp::new().await;
    let (_, owner_token) = app.user();
    let (_, stranger_token) = app.user();
    let lamp = app.seed_product("lamp", 2500, 5).await;
    let order_id = place_order(&app, &owner_token, lamp.id).await;
    let uri = format!("/api/v1/orders/{}", order_id);

    for body in [json!({ "status": "shipped" }), json!({ "status": "pending" })] {
        let response = app
            .request(Method::PATCH, &uri, Some(body), Some(&stranger_token))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // Unknown orders are reported as such whatever the requested status
    let response = app
        .request(
            Method::PATCH,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            Some(json!({ "status": "shipped" })),
            Some(&stranger_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let order = response_json(app.request(Method::GET, &uri, None, Some(&owner_token)).await).await;
    assert_eq!(order["order"]["status"], "pending");
    assert_eq!(app.inventory_of(lamp.id).await, 4);
}

#[tokio::test]
async fn listing_every_order_is_admin_only() {
    let app = TestApp::new().await;
    let (_, token) = app.user();
    let admin = app.admin_token();

    let response = app.request(Method::GET, "/api/v1/orders", None, Some(&token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.request(Method::GET, "/api/v1/orders", None, Some(&admin)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let lamp = app.seed_product("lamp", 2500, 5).await;
    place_order(&app, &token, lamp.id).await;
    let (_, other) = app.user();
    place_order(&app, &other, lamp.id).await;

    let all = response_json(app.request(Method::GET, "/api/v1/orders", None, Some(&admin)).await).await;
    assert_eq!(all["count"], 2);
    assert_eq!(all["orders"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_and_unknown_ids() {
    let app = TestApp::new().await;
    let (_, token) = app.user();

    let response = app
        .request(Method::GET, "/api/v1/orders/not-a-uuid", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .request(
            Method::PATCH,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            Some(json!({ "status": "paid" })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn error_bodies_carry_the_request_id() {
    let app = TestApp::new().await;
    let (_, token) = app.user();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&token),
        )
        .await;
    let header = response
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response_json(response).await;

    assert_eq!(body["error"], "Not Found");
    assert!(body["timestamp"].is_string());
    let request_id = body["request_id"].as_str().expect("request id in body");
    assert_eq!(header.as_deref(), Some(request_id));
}

#[tokio::test]
async fn health_endpoints_report_up() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "up");

    let response = app.request(Method::GET, "/health/ready", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["checks"]["database"]["status"], "up");
}
