use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::offer::{ClaimOutcome, DeclineAck, Offer};
use crate::error::AppError;
use crate::models::offer::OfferSnapshot;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deliveries/:id/offers", post(start_offer))
        .route("/offers/:id", get(get_offer))
        .route("/offers/:id/accept", post(accept_offer))
        .route("/offers/:id/decline", post(decline_offer))
}

#[derive(Deserialize)]
pub struct StartOfferRequest {
    pub driver_id: Uuid,
    pub window_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub driver_id: Uuid,
}

async fn start_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartOfferRequest>,
) -> Result<Json<OfferSnapshot>, AppError> {
    let delivery = state.store.read(id).await?;
    let window = payload
        .window_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.offer_window());

    let offer = state.arbiter.start_offer(&delivery, payload.driver_id, window)?;
    Ok(Json(offer.snapshot()))
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<OfferSnapshot>, AppError> {
    Ok(Json(state.arbiter.get(id)?.snapshot()))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> Result<Json<ClaimOutcome>, AppError> {
    let offer = offer_for_driver(&state, id, payload.driver_id)?;
    Ok(Json(state.arbiter.accept(&offer).await?))
}

async fn decline_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> Result<Json<DeclineAck>, AppError> {
    let offer = offer_for_driver(&state, id, payload.driver_id)?;
    Ok(Json(state.arbiter.decline(&offer).await?))
}

fn offer_for_driver(state: &AppState, offer_id: Uuid, driver_id: Uuid) -> Result<Offer, AppError> {
    let offer = state.arbiter.get(offer_id)?;
    if offer.driver_id() != driver_id {
        return Err(AppError::BadRequest(format!(
            "offer {offer_id} was not made to driver {driver_id}"
        )));
    }
    Ok(offer)
}
