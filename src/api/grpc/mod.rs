use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::engine::progression::AdvanceOutcome;
use crate::models::delivery::{Delivery, DeliveryStatus};
use crate::models::event::RealtimeEvent;
use crate::models::location::GeoPoint as Point;
use crate::state::AppState;

pub mod pb {
    tonic::include_proto!("dispatch");
}

use pb::dispatch_service_server::DispatchService;
use pb::{
    AdvanceRequest, AdvanceResponse, DeliveryResponse, GeoPoint, GetDeliveryRequest, StatusEvent,
    WatchStatusRequest,
};

pub struct GrpcDispatchService {
    state: Arc<AppState>,
}

impl GrpcDispatchService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn point_to_proto(point: Point) -> GeoPoint {
    GeoPoint {
        lat: point.lat,
        lng: point.lng,
    }
}

fn delivery_to_proto(d: &Delivery) -> DeliveryResponse {
    DeliveryResponse {
        id: d.id.to_string(),
        status: d.status.to_string(),
        stage: d.stage().as_str().to_string(),
        driver_id: d.driver_id.map(|id| id.to_string()).unwrap_or_default(),
        total_stops: d.total_stops.unwrap_or(1),
        current_stop_index: d.current_stop_index.unwrap_or(0),
        total_price: d.total_price,
        pickup: Some(point_to_proto(d.pickup)),
        dropoff: Some(point_to_proto(d.dropoff)),
        cancellation_reason: d.cancellation_reason.clone().unwrap_or_default(),
    }
}

fn outcome_to_proto(outcome: &AdvanceOutcome) -> AdvanceResponse {
    match outcome {
        AdvanceOutcome::Applied { delivery } => AdvanceResponse {
            outcome: "applied".to_string(),
            current_status: delivery.status.to_string(),
            delivery: Some(delivery_to_proto(delivery)),
        },
        AdvanceOutcome::Stale { current } => AdvanceResponse {
            outcome: "stale".to_string(),
            current_status: current.to_string(),
            delivery: None,
        },
        AdvanceOutcome::Terminal { current } => AdvanceResponse {
            outcome: "terminal".to_string(),
            current_status: current.to_string(),
            delivery: None,
        },
    }
}

fn parse_id(field: &str, value: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value)
        .map_err(|err| Status::invalid_argument(format!("{field} is not a valid id: {err}")))
}

fn parse_status(field: &str, value: &str) -> Result<DeliveryStatus, Status> {
    value
        .parse()
        .map_err(|err: String| Status::invalid_argument(format!("{field}: {err}")))
}

#[tonic::async_trait]
impl DispatchService for GrpcDispatchService {
    async fn get_delivery(
        &self,
        request: Request<GetDeliveryRequest>,
    ) -> Result<Response<DeliveryResponse>, Status> {
        let id = parse_id("id", &request.into_inner().id)?;
        let delivery = self
            .state
            .store
            .read(id)
            .await
            .map_err(crate::error::AppError::from)?;
        Ok(Response::new(delivery_to_proto(&delivery)))
    }

    async fn advance(
        &self,
        request: Request<AdvanceRequest>,
    ) -> Result<Response<AdvanceResponse>, Status> {
        let req = request.into_inner();
        let id = parse_id("delivery_id", &req.delivery_id)?;
        let expected = parse_status("expected_status", &req.expected_status)?;
        let next = parse_status("next_status", &req.next_status)?;

        let delivery = self
            .state
            .store
            .read(id)
            .await
            .map_err(crate::error::AppError::from)?;
        let outcome = self.state.progression.advance(&delivery, expected, next).await?;
        Ok(Response::new(outcome_to_proto(&outcome)))
    }

    type WatchStatusStream = Pin<Box<dyn Stream<Item = Result<StatusEvent, Status>> + Send>>;

    async fn watch_status(
        &self,
        request: Request<WatchStatusRequest>,
    ) -> Result<Response<Self::WatchStatusStream>, Status> {
        let req = request.into_inner();
        let filter = if req.delivery_id.is_empty() {
            None
        } else {
            Some(parse_id("delivery_id", &req.delivery_id)?)
        };

        let rx = self.state.events_tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
            Ok(RealtimeEvent::Status {
                delivery_id,
                status,
                stage,
                note,
                at,
            }) if filter.is_none_or(|id| id == delivery_id) => Some(Ok(StatusEvent {
                delivery_id: delivery_id.to_string(),
                status: status.to_string(),
                stage: stage.as_str().to_string(),
                note: note.unwrap_or_default(),
                at: at.to_rfc3339(),
            })),
            _ => None,
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
