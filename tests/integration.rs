use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use delivery_engine::api::rest::router;
use delivery_engine::config::Config;
use delivery_engine::state::AppState;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn setup() -> axum::Router {
    router(Arc::new(AppState::new(Config::default())))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

async fn login(app: &axum::Router) -> Uuid {
    let driver_id = Uuid::new_v4();
    let (status, _) = send(
        app,
        json_request("POST", "/sessions", json!({ "driver_id": driver_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    driver_id
}

async fn create_single(app: &axum::Router) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "dropoff": { "lat": 52.50, "lng": 13.42 },
                "total_price": 20.0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().to_string()
}

async fn offer(app: &axum::Router, delivery_id: &str, driver_id: Uuid) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/offers"),
            json!({ "driver_id": driver_id, "window_secs": 60 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().to_string()
}

async fn assign(app: &axum::Router, delivery_id: &str) -> Uuid {
    let driver_id = login(app).await;
    let offer_id = offer(app, delivery_id, driver_id).await;
    let (status, body) = send(
        app,
        json_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            json!({ "driver_id": driver_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "assigned");
    driver_id
}

async fn advance(app: &axum::Router, delivery_id: &str, expected: &str, next: &str) -> (StatusCode, Value) {
    send(
        app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/advance"),
            json!({ "expected": expected, "next": next }),
        ),
    )
    .await
}

#[tokio::test]
async fn health_returns_ok() {
    let app = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["active_offers"], 0);
    assert_eq!(body["tracked_jobs"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    assign(&app, &delivery_id).await;

    let response = app.oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("claims_total"));
    assert!(body.contains("offers_active"));
}

#[tokio::test]
async fn create_delivery_starts_pending() {
    let app = setup();
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "dropoff": { "lat": 52.50, "lng": 13.42 },
                "total_price": 20.0
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["stage"], "headingToPickup");
    assert!(body["driver_id"].is_null());
    assert!(body.get("stops").is_none());
}

#[tokio::test]
async fn create_multi_stop_delivery_lists_its_stops() {
    let app = setup();
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "stops": [
                    { "lat": 52.50, "lng": 13.42 },
                    { "lat": 52.48, "lng": 13.44 }
                ],
                "total_price": 45.0
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_stops"], 3);
    assert_eq!(body["current_stop_index"], 0);
    let stops = body["stops"].as_array().unwrap();
    assert_eq!(stops.len(), 3);
    assert_eq!(stops[0]["stop_type"], "pickup");
    assert_eq!(stops[2]["stop_number"], 3);
}

#[tokio::test]
async fn create_delivery_rejects_bad_input() {
    let app = setup();

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "total_price": 20.0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 120.0, "lng": 13.405 },
                "dropoff": { "lat": 52.50, "lng": 13.42 },
                "total_price": 20.0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "dropoff": { "lat": 52.50, "lng": 13.42 },
                "total_price": -1.0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_unknown_delivery_returns_not_found() {
    let app = setup();
    let response = app
        .oneshot(get_request(&format!("/deliveries/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn offer_requires_a_session() {
    let app = setup();
    let delivery_id = create_single(&app).await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/offers"),
            json!({ "driver_id": Uuid::new_v4() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn accepting_assigns_the_driver() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    let driver_id = assign(&app, &delivery_id).await;

    let (status, body) = send(
        &app,
        get_request(&format!("/deliveries/{delivery_id}?driver_id={driver_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "driverAssigned");
    assert_eq!(body["driver_id"], driver_id.to_string());
    assert_eq!(body["driver_earnings"], 16.0);

    let (_, session) = send(&app, get_request(&format!("/sessions/{driver_id}"))).await;
    assert_eq!(session["active_delivery"], delivery_id);
    assert_eq!(session["commission"]["rate_source"], "default");
}

#[tokio::test]
async fn second_driver_finds_the_job_taken() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    let late_driver = login(&app).await;
    let late_offer = offer(&app, &delivery_id, late_driver).await;
    assign(&app, &delivery_id).await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{late_offer}/accept"),
            json!({ "driver_id": late_driver }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_taken");
    assert_eq!(body["current"], "driverAssigned");
}

#[tokio::test]
async fn accept_by_another_driver_is_rejected() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    let driver_id = login(&app).await;
    let offer_id = offer(&app, &delivery_id, driver_id).await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{offer_id}/accept"),
            json!({ "driver_id": Uuid::new_v4() }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn declined_offer_is_gone() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    let driver_id = login(&app).await;
    let offer_id = offer(&app, &delivery_id, driver_id).await;

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/offers/{offer_id}/decline"),
            json!({ "driver_id": driver_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "declined");
    assert_eq!(body["publish"]["result"], "ack");

    let (status, _) = send(&app, get_request(&format!("/offers/{offer_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, delivery) = send(&app, get_request(&format!("/deliveries/{delivery_id}"))).await;
    assert_eq!(delivery["status"], "pending");
}

#[tokio::test]
async fn advance_follows_the_path_and_reports_replays() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    assign(&app, &delivery_id).await;

    let (status, body) = advance(&app, &delivery_id, "driverAssigned", "goingToPickup").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["delivery"]["status"], "goingToPickup");

    let (status, body) = advance(&app, &delivery_id, "driverAssigned", "goingToPickup").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "stale");
    assert_eq!(body["current"], "goingToPickup");

    let (status, _) = advance(&app, &delivery_id, "goingToPickup", "delivered").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn cancelled_delivery_stops_progress_and_tracking() {
    let app = setup();
    let delivery_id = create_single(&app).await;
    let driver_id = assign(&app, &delivery_id).await;

    let (status, event) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/location"),
            json!({ "driver_id": driver_id, "location": { "lat": 52.51, "lng": 13.41 } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["type"], "location");
    assert!(event["distance_to_stop_km"].as_f64().unwrap() > 0.0);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/cancel"),
            json!({ "expected": "driverAssigned", "reason": "restaurant closed" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["status"], "cancelled");
    assert_eq!(body["delivery"]["cancellation_reason"], "restaurant closed");

    let (status, _) = advance(&app, &delivery_id, "cancelled", "goingToPickup").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/location"),
            json!({ "driver_id": driver_id, "location": { "lat": 52.51, "lng": 13.41 } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, health) = send(&app, get_request("/health")).await;
    assert_eq!(health["tracked_jobs"], 0);
}

#[tokio::test]
async fn multi_stop_delivery_is_driven_by_its_stops() {
    let app = setup();
    let (_, created) = send(
        &app,
        json_request(
            "POST",
            "/deliveries",
            json!({
                "pickup": { "lat": 52.52, "lng": 13.405 },
                "stops": [{ "lat": 52.50, "lng": 13.42 }],
                "total_price": 30.0
            }),
        ),
    )
    .await;
    let delivery_id = created["id"].as_str().unwrap().to_string();
    assign(&app, &delivery_id).await;
    advance(&app, &delivery_id, "driverAssigned", "goingToPickup").await;

    let (status, _) = advance(&app, &delivery_id, "goingToPickup", "pickupArrived").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        json_request("POST", &format!("/deliveries/{delivery_id}/stops/2/arrive"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        &app,
        json_request("POST", &format!("/deliveries/{delivery_id}/stops/1/arrive"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["delivery"]["status"], "pickupArrived");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/stops/1/complete"),
            json!({ "photo_url": "https://proof.example/pickup.jpg" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["status"], "packageCollected");

    advance(&app, &delivery_id, "packageCollected", "goingToDestination").await;
    send(
        &app,
        json_request("POST", &format!("/deliveries/{delivery_id}/stops/2/arrive"), json!({})),
    )
    .await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/stops/2/complete"),
            json!({ "photo_url": "https://proof.example/door.jpg" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/deliveries/{delivery_id}/stops/2/fail"),
            json!({ "reason": "customer not home" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stop"]["status"], "failed");
    assert_eq!(body["delivery"]["status"], "delivered");

    let (status, body) = send(
        &app,
        json_request("POST", &format!("/deliveries/{delivery_id}/sequence/advance"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["delivery"]["current_stop_index"], 2);
}

#[tokio::test]
async fn commission_push_updates_the_session() {
    let app = setup();
    let driver_id = login(&app).await;

    let (status, body) = send(
        &app,
        json_request(
            "PUT",
            &format!("/sessions/{driver_id}/commission"),
            json!({ "commission_rate": 0.15 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commission"]["commission_rate"], 0.15);
    assert_eq!(body["commission"]["rate_source"], "custom");

    let (status, _) = send(
        &app,
        json_request(
            "PUT",
            &format!("/sessions/{driver_id}/commission"),
            json!({ "commission_rate": 1.5 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{driver_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (status, _) = send(&app, get_request(&format!("/sessions/{driver_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
