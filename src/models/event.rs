use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::delivery::{DeliveryStatus, Stage};
use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Status {
        delivery_id: Uuid,
        status: DeliveryStatus,
        stage: Stage,
        note: Option<String>,
        at: DateTime<Utc>,
    },
    Location {
        delivery_id: Uuid,
        driver_id: Uuid,
        location: GeoPoint,
        distance_to_stop_km: f64,
        at: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    pub fn delivery_id(&self) -> Uuid {
        match self {
            RealtimeEvent::Status { delivery_id, .. } | RealtimeEvent::Location { delivery_id, .. } => {
                *delivery_id
            }
        }
    }
}
