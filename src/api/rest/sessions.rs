use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::session::SessionView;
use crate::error::AppError;
use crate::models::commission::{CommissionDetails, RateSource};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(login))
        .route("/sessions/:driver_id", get(get_session).delete(logout))
        .route("/sessions/:driver_id/commission", put(rate_changed))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct RateChangedRequest {
    pub commission_rate: f64,
    pub rate_source: Option<RateSource>,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<SessionView>, AppError> {
    state.sessions.login(payload.driver_id).await?;
    Ok(Json(state.sessions.view(payload.driver_id)?))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.view(driver_id)?))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.sessions.logout(driver_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rate_changed(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<Uuid>,
    Json(payload): Json<RateChangedRequest>,
) -> Result<Json<SessionView>, AppError> {
    let details = CommissionDetails {
        commission_rate: payload.commission_rate,
        rate_source: payload.rate_source.unwrap_or(RateSource::Custom),
    };
    state.sessions.rate_changed(driver_id, details).await?;
    Ok(Json(state.sessions.view(driver_id)?))
}
