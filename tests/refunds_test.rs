mod common;

use axum::http::{Method, StatusCode};
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

async fn delivered_order(app: &TestApp, token: &str) -> String {
    let sku = app.seed_sku(dec!(1500), 5).await;
    app.add_to_cart(token, sku.variant.id, 1).await;
    let (status, order) = app.place_cod(token).await;
    assert_eq!(status, StatusCode::CREATED);
    let order_id = order["id"].as_str().unwrap().to_string();

    let (status, _) = set_status(app, &order_id, "DELIVERED").await;
    assert_eq!(status, StatusCode::OK);
    order_id
}

async fn set_status(app: &TestApp, order_id: &str, status: &str) -> (StatusCode, Value) {
    app.call(
        Method::PUT,
        &format!("/api/v1/orders/{order_id}/status"),
        Some(json!({ "status": status })),
        Some(&app.admin_token()),
    )
    .await
}

async fn request_refund(app: &TestApp, token: &str, body: Value) -> (StatusCode, Value) {
    app.call(Method::POST, "/api/v1/refunds/request", Some(body), Some(token))
        .await
}

fn refund_body(order_id: &str) -> Value {
    json!({
        "order_id": order_id,
        "reason": "Torn seam",
        "message": "Left sleeve came apart on first wash",
        "image_url": "/uploads/refunds/seam.jpg"
    })
}

fn last_subject(app: &TestApp) -> String {
    app.mailer.sent.lock().unwrap().last().unwrap().subject.clone()
}

#[tokio::test]
async fn delivered_order_refund_is_requested_then_approved_once() {
    let app = TestApp::new().await;
    let user = app.seed_user(true).await;
    let token = app.token_for(&user);
    let order_id = delivered_order(&app, &token).await;

    let (status, refund) = request_refund(&app, &token, refund_body(&order_id)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(refund["status"], "REQUESTED");
    assert_eq!(refund["order_id"], order_id.as_str());
    assert_eq!(refund["image_url"], "/uploads/refunds/seam.jpg");
    assert_eq!(last_subject(&app), "Refund Request Received");

    let (status, body) = request_refund(&app, &token, refund_body(&order_id)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Refund request already submitted for this order");

    let (status, mine) = app
        .call(Method::GET, "/api/v1/refunds/my", None, Some(&token))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["order"]["status"], "DELIVERED");
    assert!(mine[0].get("user").is_none());

    let admin = app.admin_token();
    let (_, pending) = app
        .call(Method::GET, "/api/v1/refunds?status=requested", None, Some(&admin))
        .await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["user"]["email"], json!(user.email));

    let refund_id = refund["id"].as_str().unwrap();
    let (status, approved) = app
        .call(
            Method::PUT,
            &format!("/api/v1/refunds/{refund_id}/approve"),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["status"], "APPROVED");
    assert_eq!(last_subject(&app), "Refund Approved");

    for action in ["approve", "reject"] {
        let (status, body) = app
            .call(
                Method::PUT,
                &format!("/api/v1/refunds/{refund_id}/{action}"),
                None,
                Some(&admin),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Refund request already processed");
    }
}

#[tokio::test]
async fn refund_needs_owner_delivery_and_photo() {
    let app = TestApp::new().await;
    let user = app.seed_user(true).await;
    let token = app.token_for(&user);

    let sku = app.seed_sku(dec!(700), 5).await;
    app.add_to_cart(&token, sku.variant.id, 1).await;
    let (_, order) = app.place_cod(&token).await;
    let open_order = order["id"].as_str().unwrap().to_string();

    let (status, body) = request_refund(&app, &token, refund_body(&open_order)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Refund allowed only for delivered orders");

    let delivered = delivered_order(&app, &token).await;

    let mut no_photo = refund_body(&delivered);
    no_photo["image_url"] = json!("  ");
    let (status, body) = request_refund(&app, &token, no_photo).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Damage image is required");

    let stranger = app.seed_user(true).await;
    let (status, _) =
        request_refund(&app, &app.token_for(&stranger), refund_body(&delivered)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) =
        request_refund(&app, &token, refund_body(&uuid::Uuid::new_v4().to_string())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejection_carries_admin_note() {
    let app = TestApp::new().await;
    let user = app.seed_user(true).await;
    let token = app.token_for(&user);
    let order_id = delivered_order(&app, &token).await;
    let (_, refund) = request_refund(&app, &token, refund_body(&order_id)).await;
    let refund_id = refund["id"].as_str().unwrap();

    let admin = app.admin_token();
    let (status, rejected) = app
        .call(
            Method::PUT,
            &format!("/api/v1/refunds/{refund_id}/reject"),
            Some(json!({ "admin_note": "Wear and tear is not covered" })),
            Some(&admin),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["status"], "REJECTED");
    assert_eq!(rejected["admin_note"], "Wear and tear is not covered");

    {
        let sent = app.mailer.sent.lock().unwrap();
        let last = sent.last().unwrap();
        assert_eq!(last.subject, "Refund Rejected");
        assert_eq!(last.recipient, user.email);
        assert!(last.body.contains("Wear and tear is not covered"));
    }

    let (_, approved) = app
        .call(Method::GET, "/api/v1/refunds?status=APPROVED", None, Some(&admin))
        .await;
    assert_eq!(approved, json!([]));

    let (status, body) = app
        .call(Method::GET, "/api/v1/refunds?status=REFUNDED", None, Some(&admin))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid refund status");

    let (status, _) = app
        .call(Method::GET, "/api/v1/refunds", None, Some(&token))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_refund_decision_is_not_found() {
    let app = TestApp::new().await;

    let (status, body) = app
        .call(
            Method::PUT,
            &format!("/api/v1/refunds/{}/approve", uuid::Uuid::new_v4()),
            None,
            Some(&app.admin_token()),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Refund request not found");
}
