#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use storefront_api::{
    auth::{ROLE_ADMIN, ROLE_CUSTOMER},
    config::AppConfig,
    db,
    entities::{
        commerce::{
            category, coupon, coupon_condition, product_variant, CouponModel, DiscountType,
            ProductVariant, ProductVariantModel,
        },
        product, user, ProductModel, UserModel, UserRole,
    },
    events::{self, EventSender},
    handlers::Collaborators,
    notifications::{
        Attachment, EmailMessage, EmailSender, InvoiceRenderer, NotificationError, OrderDocument,
    },
    services::{
        commerce::coupon_validator::CouponCondition,
        payment_gateway::{CreateIntentRequest, GatewayError, GatewayIntent, PaymentGateway},
        payments::sign_webhook_payload,
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_test_secret";
const JWT_SECRET: &str =
    "integration-test-secret-integration-test-secret-integration-test-0001";

/// In-memory gateway recording every intent request
#[derive(Default)]
pub struct FakeGateway {
    pub requests: Mutex<Vec<CreateIntentRequest>>,
    pub fail: AtomicBool,
    counter: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> Result<GatewayIntent, GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        Ok(GatewayIntent {
            id: format!("pi_test_{n}"),
            client_secret: format!("pi_test_{n}_secret"),
        })
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    pub fail: AtomicBool,
    pub rendered: AtomicUsize,
}

#[async_trait]
impl InvoiceRenderer for FakeRenderer {
    async fn render(&self, document: &OrderDocument) -> Result<Attachment, NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Render("renderer offline".into()));
        }
        self.rendered.fetch_add(1, Ordering::SeqCst);
        Ok(Attachment {
            file_name: format!("invoice-{}.pdf", document.order.id),
            content_type: "application/pdf".into(),
            content: bytes::Bytes::from_static(b"%PDF-fake"),
        })
    }
}

#[derive(Default)]
pub struct FakeMailer {
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl EmailSender for FakeMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotificationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Delivery("smtp down".into()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// A seeded purchasable variant with its product
pub struct Sku {
    pub product: ProductModel,
    pub variant: ProductVariantModel,
}

/// Helper harness for spinning up the application backed by a temp-file SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub renderer: Arc<FakeRenderer>,
    pub mailer: Arc<FakeMailer>,
    category_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a new test application, letting the caller adjust the config.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection serializes SQLite writers across concurrent requests
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.external_call_timeout_secs = 2;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(1024);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let renderer = Arc::new(FakeRenderer::default());
        let mailer = Arc::new(FakeMailer::default());

        let state = AppState::new(
            Arc::new(pool),
            Arc::new(cfg),
            Arc::new(EventSender::new(event_tx)),
            Collaborators {
                gateway: gateway.clone(),
                invoice_renderer: renderer.clone(),
                mailer: mailer.clone(),
            },
        );

        let category_id = Uuid::new_v4();
        category::ActiveModel {
            id: Set(category_id),
            name: Set("Apparel".into()),
            created_at: Set(Utc::now()),
        }
        .insert(&*state.db)
        .await
        .expect("seed category");

        Self {
            router: storefront_api::build_router(state.clone()),
            state,
            gateway,
            renderer,
            mailer,
            category_id,
            _event_task: event_task,
            _dir: dir,
        }
    }

    pub fn category_id(&self) -> Uuid {
        self.category_id
    }

    pub async fn seed_user(&self, verified: bool) -> UserModel {
        let id = Uuid::new_v4();
        user::ActiveModel {
            id: Set(id),
            name: Set("Test Customer".into()),
            email: Set(format!("customer-{id}@shop.test")),
            contact_number: Set(Some("01700000000".into())),
            address: Set(Some("House 1, Road 2, Dhaka".into())),
            country: Set(Some("Bangladesh".into())),
            is_verified: Set(verified),
            role: Set(UserRole::Customer),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed user")
    }

    pub fn token_for(&self, user: &UserModel) -> String {
        self.state
            .auth
            .generate_token(user.id, Some(user.email.clone()), vec![ROLE_CUSTOMER.into()])
            .expect("mint customer token")
    }

    pub fn admin_token(&self) -> String {
        self.state
            .auth
            .generate_token(Uuid::new_v4(), Some("admin@shop.test".into()), vec![ROLE_ADMIN.into()])
            .expect("mint admin token")
    }

    pub async fn seed_sku(&self, price: Decimal, stock: i32) -> Sku {
        self.seed_sku_in(self.category_id, price, stock).await
    }

    pub async fn seed_sku_in(&self, category_id: Uuid, price: Decimal, stock: i32) -> Sku {
        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set("Cotton Panjabi".into()),
            price: Set(price),
            category_id: Set(category_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product");

        let variant = product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            size: Set(Some("M".into())),
            color: Set(Some("White".into())),
            stock: Set(stock),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant");

        Sku { product, variant }
    }

    pub async fn seed_category(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        category::ActiveModel {
            id: Set(id),
            name: Set(name.into()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed category");
        id
    }

    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        ProductVariant::find_by_id(variant_id)
            .one(&*self.state.db)
            .await
            .expect("load variant")
            .expect("variant exists")
            .stock
    }

    pub async fn set_price(&self, product: &ProductModel, price: Decimal) {
        let mut active: product::ActiveModel = product.clone().into();
        active.price = Set(price);
        active.updated_at = Set(Utc::now());
        active.update(&*self.state.db).await.expect("update price");
    }

    pub async fn seed_coupon(&self, seed: CouponSeed) -> CouponModel {
        let now = Utc::now();
        let coupon = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(seed.code.to_uppercase()),
            discount_type: Set(seed.discount_type),
            value: Set(seed.value),
            max_discount: Set(seed.max_discount),
            min_order_amount: Set(seed.min_order_amount),
            total_usage_limit: Set(seed.usage_limit),
            used_count: Set(0),
            expires_at: Set(seed.expires_at),
            is_stackable: Set(false),
            is_active: Set(seed.active),
            created_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon");

        for condition in seed.conditions {
            let (kind, operator, value) = condition.encode();
            coupon_condition::ActiveModel {
                id: Set(Uuid::new_v4()),
                coupon_id: Set(coupon.id),
                kind: Set(kind),
                operator: Set(operator),
                value: Set(value),
                created_at: Set(now),
            }
            .insert(&*self.state.db)
            .await
            .expect("seed coupon condition");
        }

        coupon
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
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
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Request and decode the JSON body in one step
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let response = self.request(method, uri, body, token).await;
        let status = response.status();
        (status, response_json(response).await)
    }

    pub async fn add_to_cart(
        &self,
        token: &str,
        variant_id: Uuid,
        quantity: i32,
    ) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            "/api/v1/cart/items",
            Some(serde_json::json!({ "variant_id": variant_id, "quantity": quantity })),
            Some(token),
        )
        .await
    }

    pub async fn apply_coupon(&self, token: &str, code: &str) -> (StatusCode, Value) {
        self.call(
            Method::POST,
            "/api/v1/cart/coupon",
            Some(serde_json::json!({ "code": code })),
            Some(token),
        )
        .await
    }

    pub async fn place_cod(&self, token: &str) -> (StatusCode, Value) {
        self.call(Method::POST, "/api/v1/orders/cod", None, Some(token))
            .await
    }

    /// Deliver a signed `payment_intent.succeeded` event
    pub async fn deliver_succeeded(&self, transaction_id: &str) -> (StatusCode, Value) {
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": transaction_id, "object": "payment_intent" } }
        }))
        .expect("serialize event");
        let signature = sign_webhook_payload(WEBHOOK_SECRET, Utc::now().timestamp(), &payload)
            .expect("sign payload");
        self.deliver_raw(payload, Some(signature)).await
    }

    pub async fn deliver_raw(
        &self,
        payload: Vec<u8>,
        signature: Option<String>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        let request = builder.body(Body::from(payload)).expect("build webhook request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook");
        let status = response.status();
        (status, response_json(response).await)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub struct CouponSeed {
    pub code: &'static str,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    pub usage_limit: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub conditions: Vec<CouponCondition>,
}

impl CouponSeed {
    pub fn percent(code: &'static str, value: Decimal) -> Self {
        Self {
            code,
            discount_type: DiscountType::Percent,
            value,
            max_discount: None,
            min_order_amount: None,
            usage_limit: None,
            expires_at: None,
            active: true,
            conditions: Vec::new(),
        }
    }

    pub fn fixed(code: &'static str, value: Decimal) -> Self {
        Self {
            discount_type: DiscountType::Fixed,
            ..Self::percent(code, value)
        }
    }
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("response body is json")
    }
}

/// Decimal fields serialize as strings; compare numerically
pub fn dec_of(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
