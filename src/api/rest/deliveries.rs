use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::progression::AdvanceOutcome;
use crate::engine::sequencer::{MultiStopSequencer, StopOutcome};
use crate::error::AppError;
use crate::geo::is_valid;
use crate::models::delivery::{Delivery, DeliveryStatus, Stage};
use crate::models::event::RealtimeEvent;
use crate::models::location::GeoPoint;
use crate::models::stop::{build_stops, DeliveryStop, Proof};
use crate::realtime::tracking::tracking_target;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries", post(create_delivery))
        .route("/deliveries/:id", get(get_delivery))
        .route("/deliveries/:id/advance", post(advance_delivery))
        .route("/deliveries/:id/cancel", post(cancel_delivery))
        .route("/deliveries/:id/fail", post(fail_delivery))
        .route("/deliveries/:id/location", post(report_location))
        .route("/deliveries/:id/sequence/advance", post(advance_sequence))
        .route("/deliveries/:id/stops/:number/arrive", post(arrive_at_stop))
        .route("/deliveries/:id/stops/:number/complete", post(complete_stop))
        .route("/deliveries/:id/stops/:number/fail", post(fail_stop))
}

#[derive(Deserialize)]
pub struct CreateDeliveryRequest {
    pub pickup: GeoPoint,
    pub dropoff: Option<GeoPoint>,
    #[serde(default)]
    pub stops: Vec<GeoPoint>,
    pub total_price: f64,
}

#[derive(Deserialize)]
pub struct DeliveryQuery {
    pub driver_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub expected: DeliveryStatus,
    pub next: DeliveryStatus,
}

#[derive(Deserialize)]
pub struct AbortRequest {
    pub expected: DeliveryStatus,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct FailStopRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub driver_id: Uuid,
    pub location: GeoPoint,
}

#[derive(Serialize)]
pub struct DeliveryView {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stops: Vec<DeliveryStop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_earnings: Option<f64>,
}

async fn create_delivery(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateDeliveryRequest>,
) -> Result<Json<DeliveryView>, AppError> {
    if !payload.total_price.is_finite() || payload.total_price < 0.0 {
        return Err(AppError::BadRequest("total_price must be >= 0".to_string()));
    }
    let all_points = std::iter::once(&payload.pickup)
        .chain(payload.dropoff.iter())
        .chain(payload.stops.iter());
    for point in all_points {
        if !is_valid(point) {
            return Err(AppError::BadRequest("location out of range".to_string()));
        }
    }

    let (delivery, stops) = if payload.stops.is_empty() {
        let dropoff = payload.dropoff.ok_or_else(|| {
            AppError::BadRequest("either dropoff or stops is required".to_string())
        })?;
        (
            Delivery::single_stop(payload.pickup, dropoff, payload.total_price),
            Vec::new(),
        )
    } else {
        let delivery = Delivery::multi_stop(payload.pickup, &payload.stops, payload.total_price);
        let stops = build_stops(delivery.id, payload.pickup, &payload.stops);
        (delivery, stops)
    };

    state.store.insert(delivery.clone(), stops.clone()).await?;
    tracing::info!(
        delivery_id = %delivery.id,
        total_stops = delivery.total_stops.unwrap_or(1),
        "delivery created"
    );

    Ok(Json(DeliveryView {
        stage: delivery.stage(),
        delivery,
        stops,
        driver_earnings: None,
    }))
}

async fn get_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Json<DeliveryView>, AppError> {
    let delivery = state.store.read(id).await?;
    let stops = state.store.read_stops(id).await?;

    let driver_earnings = match query.driver_id {
        Some(driver_id) => Some(state.sessions.get(driver_id)?.driver_earnings(delivery.total_price)),
        None => None,
    };

    Ok(Json(DeliveryView {
        stage: delivery.stage(),
        delivery,
        stops,
        driver_earnings,
    }))
}

async fn advance_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let delivery = state.store.read(id).await?;
    let outcome = state
        .progression
        .advance(&delivery, payload.expected, payload.next)
        .await?;
    Ok(Json(outcome))
}

async fn cancel_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AbortRequest>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let delivery = state.store.read(id).await?;
    let outcome = state
        .progression
        .cancel(&delivery, payload.expected, &payload.reason)
        .await?;
    Ok(Json(outcome))
}

async fn fail_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AbortRequest>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let delivery = state.store.read(id).await?;
    let outcome = state
        .progression
        .fail(&delivery, payload.expected, &payload.reason)
        .await?;
    Ok(Json(outcome))
}

async fn report_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<RealtimeEvent>, AppError> {
    let delivery = state.store.read(id).await?;
    if delivery.status.is_terminal() {
        return Err(AppError::Conflict(format!("delivery {id} is no longer active")));
    }
    let stops = state.store.read_stops(id).await?;
    let target = tracking_target(&delivery, &stops);

    let event = state
        .tracker
        .ping(id, payload.driver_id, payload.location, target)?;
    Ok(Json(event))
}

async fn advance_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let mut sequencer = MultiStopSequencer::load(state.progression.clone(), id).await?;
    Ok(Json(sequencer.advance_delivery().await?))
}

async fn arrive_at_stop(
    State(state): State<Arc<AppState>>,
    Path((id, number)): Path<(Uuid, u32)>,
) -> Result<Json<StopOutcome>, AppError> {
    let mut sequencer = MultiStopSequencer::load(state.progression.clone(), id).await?;
    Ok(Json(sequencer.arrive_at_stop(number).await?))
}

async fn complete_stop(
    State(state): State<Arc<AppState>>,
    Path((id, number)): Path<(Uuid, u32)>,
    Json(proof): Json<Proof>,
) -> Result<Json<StopOutcome>, AppError> {
    let mut sequencer = MultiStopSequencer::load(state.progression.clone(), id).await?;
    Ok(Json(sequencer.complete_stop(number, proof).await?))
}

async fn fail_stop(
    State(state): State<Arc<AppState>>,
    Path((id, number)): Path<(Uuid, u32)>,
    Json(payload): Json<FailStopRequest>,
) -> Result<Json<StopOutcome>, AppError> {
    let mut sequencer = MultiStopSequencer::load(state.progression.clone(), id).await?;
    Ok(Json(sequencer.fail_stop(number, &payload.reason).await?))
}
