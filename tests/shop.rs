use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use surge::{Config, Runner};
use tokio::sync::Mutex;

const SESSION_HEADER: &str = "x-session-id";
const VARIANT: &str = "variant-42";

/// Minimal shop: carts keyed by server assigned sessions and one contended
/// stock counter. With `check_then_act` set, orders check stock, release the
/// lock and decrement later, which lets two buyers take the same last unit.
struct Shop {
    carts: Mutex<HashMap<String, (String, i64)>>,
    stock: Mutex<HashMap<String, i64>>,
    sessions: AtomicU64,
    check_then_act: bool,
}

type AppState = Arc<Shop>;

async fn add_to_cart(
    State(shop): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if headers.get(SESSION_HEADER).is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing session"})));
    }
    let Some(variant) = body["variantId"].as_str() else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing variantId"})));
    };
    let quantity = body["quantity"].as_i64().unwrap_or(1);
    // The server never trusts the client supplied id
    let session = format!("srv-{}", shop.sessions.fetch_add(1, Ordering::SeqCst));
    shop.carts
        .lock()
        .await
        .insert(session.clone(), (variant.to_string(), quantity));
    (
        StatusCode::OK,
        Json(json!({"data": {"sessionId": session, "items": 1}})),
    )
}

async fn order_from_cart(
    State(shop): State<AppState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let session = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let Some((variant, quantity)) = shop.carts.lock().await.remove(session) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown cart"})));
    };

    if shop.check_then_act {
        let available = shop.stock.lock().await.get(&variant).copied().unwrap_or(0);
        if available < quantity {
            return (StatusCode::CONFLICT, Json(json!({"error": "sold out"})));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        *shop.stock.lock().await.entry(variant).or_default() -= quantity;
        return (StatusCode::CREATED, Json(json!({"data": {"status": "created"}})));
    }

    let mut stock = shop.stock.lock().await;
    let available = stock.entry(variant).or_default();
    if *available < quantity {
        return (StatusCode::CONFLICT, Json(json!({"error": "sold out"})));
    }
    *available -= quantity;
    (StatusCode::CREATED, Json(json!({"data": {"status": "created"}})))
}

async fn search(Json(body): Json<Value>) -> Json<Value> {
    let query = body["query"].as_str().unwrap_or_default();
    Json(json!({"data": {"products": [{"id": 1, "title": format!("{query} 1")}]}}))
}

async fn serve(stock: i64, check_then_act: bool) -> SocketAddr {
    let shop = Arc::new(Shop {
        carts: Mutex::default(),
        stock: Mutex::new(HashMap::from([(VARIANT.to_string(), stock)])),
        sessions: AtomicU64::new(0),
        check_then_act,
    });
    let app = Router::new()
        .route("/cart/add", post(add_to_cart))
        .route("/orders/from-cart", post(order_from_cart))
        .route("/products/search", post(search))
        .with_state(shop);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn race_config(addr: SocketAddr, users: usize) -> Config {
    format!(
        r#"{{
            "base_url": "http://{addr}",
            "timeout": "30s",
            "request_timeout": "5s",
            "session_header": {{ "name": "{SESSION_HEADER}", "variable": "sessionId" }},
            "thresholds": {{
                "max_transport_error_rate": 0.0,
                "checks": [
                    {{ "label": "Step 2: Order Success (201)", "min_passes": 1, "max_passes": 1 }},
                    {{ "label": "Step 2: Server Error (500)", "max_passes": 0 }}
                ]
            }},
            "scenarios": [{{
                "name": "checkout-race",
                "executor": {{ "type": "fixed", "users": {users}, "iterations": {users} }},
                "variables": {{ "sessionId": "${{uuid}}" }},
                "steps": [
                    {{
                        "name": "add to cart",
                        "method": "POST",
                        "path": "/cart/add",
                        "body": {{ "variantId": "{VARIANT}", "quantity": 1 }},
                        "extract": {{ "sessionId": "data.sessionId" }},
                        "checks": [
                            {{ "label": "Step 1: Add to cart success (200/201)", "status_in": [200, 201], "critical": true }}
                        ],
                        "delay": "100ms"
                    }},
                    {{
                        "name": "order from cart",
                        "method": "POST",
                        "path": "/orders/from-cart",
                        "body": {{
                            "customerName": "Stress Tester",
                            "customerEmail": "tester${{vu}}@example.com",
                            "customerPhone": "0735130901",
                            "shippingAddress": "123 Street",
                            "paymentMethod": "COD",
                            "items": [{{ "variantId": "{VARIANT}", "quantity": 1 }}]
                        }},
                        "checks": [
                            {{ "label": "Step 2: Order Success (201)", "status": 201 }},
                            {{ "label": "Step 2: Sold Out/Conflict (400/409)", "status_in": [400, 409] }},
                            {{ "label": "Step 2: Server Error (500)", "status": 500 }}
                        ]
                    }}
                ]
            }}]
        }}"#
    )
    .parse()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_buyers_one_unit_exactly_one_wins() {
    let addr = serve(1, false).await;
    let report = Runner::new(&race_config(addr, 2))
        .unwrap()
        .run()
        .await
        .unwrap();

    let race = report.scenario("checkout-race").unwrap();
    assert!(report.passed(), "{report}");
    assert_eq!(race.check("Step 1: Add to cart success (200/201)").passes, 2);
    assert_eq!(race.check("Step 2: Order Success (201)").passes, 1);
    assert_eq!(race.check("Step 2: Sold Out/Conflict (400/409)").passes, 1);
    assert_eq!(race.status_count(201), 1);
    assert_eq!(race.status_count(409), 1);
    // Orders only reach the cart under the server assigned session
    assert_eq!(race.status_count(404), 0);
    assert_eq!(race.iterations.completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_buyers_one_unit() {
    let addr = serve(1, false).await;
    let report = Runner::new(&race_config(addr, 50))
        .unwrap()
        .run()
        .await
        .unwrap();

    let race = report.scenario("checkout-race").unwrap();
    assert!(report.passed(), "{report}");
    assert_eq!(race.requests, 100);
    assert_eq!(race.status_count(201), 1);
    assert_eq!(race.status_count(409), 49);
    assert_eq!(race.max_users, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_sale_is_reported_as_violation() {
    let addr = serve(1, true).await;
    let report = Runner::new(&race_config(addr, 2))
        .unwrap()
        .run()
        .await
        .unwrap();

    let race = report.scenario("checkout-race").unwrap();
    assert!(!report.passed());
    assert_eq!(race.check("Step 2: Order Success (201)").passes, 2);
    assert!(race
        .violations
        .iter()
        .any(|violation| violation.contains("Step 2: Order Success (201)")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_ramp_follows_stages() {
    let addr = serve(0, false).await;
    let config: Config = format!(
        r#"{{
            "base_url": "http://{addr}",
            "tick": "100ms",
            "thresholds": {{ "max_check_failure_rate": 0.0 }},
            "scenarios": [{{
                "name": "catalog",
                "executor": {{ "type": "ramping", "stages": [
                    {{ "duration": "500ms", "target": 4 }},
                    {{ "duration": "500ms", "target": 4 }},
                    {{ "duration": "500ms", "target": 0 }}
                ]}},
                "steps": [{{
                    "name": "search",
                    "method": "POST",
                    "path": "/products/search",
                    "body": {{ "query": "shirt-${{vu}}" }},
                    "checks": [
                        {{ "label": "status is 200", "status": 200 }},
                        {{ "label": "has products", "json_field": {{ "path": "data.products.0.id", "equals": 1 }} }}
                    ],
                    "delay": "50ms"
                }}]
            }}]
        }}"#
    )
    .parse()
    .unwrap();

    let report = Runner::new(&config).unwrap().run().await.unwrap();

    let catalog = report.scenario("catalog").unwrap();
    assert!(report.passed(), "{report}");
    assert_eq!(catalog.max_users, 4);
    assert!(catalog.requests > 0);
    assert_eq!(catalog.check("status is 200").passes, catalog.requests);
    assert!(catalog.duration >= Duration::from_millis(1500));
}

#[tokio::test]
async fn unresolvable_template_is_a_configuration_error() {
    let config: Config = r#"{
        "base_url": "http://127.0.0.1:1",
        "scenarios": [{
            "name": "broken",
            "executor": { "type": "fixed", "users": 1, "iterations": 1 },
            "steps": [{ "name": "order", "path": "/orders/${orderId}" }]
        }]
    }"#
    .parse()
    .unwrap();

    let err = Runner::new(&config).err().unwrap();
    assert!(matches!(err, surge::error::Error::Configuration(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connections_are_transport_errors() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = race_config(addr, 3);
    config.thresholds = Default::default();
    let report = Runner::new(&config).unwrap().run().await.unwrap();

    let race = report.scenario("checkout-race").unwrap();
    assert!(report.passed());
    assert_eq!(race.requests, 3);
    assert_eq!(race.transport_errors, 3);
    assert_eq!(race.iterations.aborted, 3);
    assert_eq!(race.check("Step 1: Add to cart success (200/201)").fails, 3);
    // Aborted before the order step
    assert_eq!(race.check("Step 2: Order Success (201)").fails, 0);
}
