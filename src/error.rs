use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::delivery::DeliveryStatus;
use crate::models::offer::OfferOutcome;
use crate::models::stop::StopStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transition {from} -> {to} is not on the delivery's path")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("stop {stop_number} cannot move from {from:?} to {to:?}")]
    InvalidStopTransition {
        stop_number: u32,
        from: StopStatus,
        to: StopStatus,
    },

    #[error("stop {stop_number} is blocked until stop {blocking} is completed or failed")]
    OutOfOrder { stop_number: u32, blocking: u32 },

    #[error("stop {stop_number} requires a {artifact} proof")]
    MissingProof {
        stop_number: u32,
        artifact: &'static str,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("offer already {}", .0.as_str())]
    OfferClosed(OfferOutcome),

    #[error("a claim for this offer is already in flight")]
    ClaimInFlight,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => AppError::Transient(msg),
            StoreError::NotFound(_) | StoreError::StopNotFound { .. } => {
                AppError::NotFound(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::ClaimInFlight => StatusCode::CONFLICT,
            AppError::InvalidTransition { .. }
            | AppError::InvalidStopTransition { .. }
            | AppError::OutOfOrder { .. }
            | AppError::MissingProof { .. }
            | AppError::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::OfferClosed(_) => StatusCode::GONE,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Invariant(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<AppError> for tonic::Status {
    fn from(err: AppError) -> Self {
        let message = err.to_string();
        match err {
            AppError::NotFound(_) => tonic::Status::not_found(message),
            AppError::BadRequest(_) => tonic::Status::invalid_argument(message),
            AppError::Conflict(_) | AppError::ClaimInFlight => tonic::Status::aborted(message),
            AppError::InvalidTransition { .. }
            | AppError::InvalidStopTransition { .. }
            | AppError::OutOfOrder { .. }
            | AppError::MissingProof { .. }
            | AppError::Precondition(_)
            | AppError::OfferClosed(_) => tonic::Status::failed_precondition(message),
            AppError::Transient(_) => tonic::Status::unavailable(message),
            AppError::Invariant(_) | AppError::Internal(_) => tonic::Status::internal(message),
        }
    }
}
