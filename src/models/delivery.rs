use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Pending,
    Offered,
    DriverAssigned,
    GoingToPickup,
    PickupArrived,
    PackageCollected,
    GoingToDestination,
    AtDestination,
    Delivered,
    Cancelled,
    Failed,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 11] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Offered,
        DeliveryStatus::DriverAssigned,
        DeliveryStatus::GoingToPickup,
        DeliveryStatus::PickupArrived,
        DeliveryStatus::PackageCollected,
        DeliveryStatus::GoingToDestination,
        DeliveryStatus::AtDestination,
        DeliveryStatus::Delivered,
        DeliveryStatus::Cancelled,
        DeliveryStatus::Failed,
    ];

    pub fn stage(self) -> Stage {
        match self {
            DeliveryStatus::Pending
            | DeliveryStatus::Offered
            | DeliveryStatus::DriverAssigned
            | DeliveryStatus::GoingToPickup
            | DeliveryStatus::PickupArrived => Stage::HeadingToPickup,
            DeliveryStatus::PackageCollected
            | DeliveryStatus::GoingToDestination
            | DeliveryStatus::AtDestination => Stage::HeadingToDelivery,
            DeliveryStatus::Delivered | DeliveryStatus::Cancelled | DeliveryStatus::Failed => {
                Stage::DeliveryComplete
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Cancelled | DeliveryStatus::Failed
        )
    }

    pub fn is_aborted(self) -> bool {
        matches!(self, DeliveryStatus::Cancelled | DeliveryStatus::Failed)
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::Offered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Offered => "offered",
            DeliveryStatus::DriverAssigned => "driverAssigned",
            DeliveryStatus::GoingToPickup => "goingToPickup",
            DeliveryStatus::PickupArrived => "pickupArrived",
            DeliveryStatus::PackageCollected => "packageCollected",
            DeliveryStatus::GoingToDestination => "goingToDestination",
            DeliveryStatus::AtDestination => "atDestination",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown delivery status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    HeadingToPickup,
    HeadingToDelivery,
    DeliveryComplete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::HeadingToPickup => "headingToPickup",
            Stage::HeadingToDelivery => "headingToDelivery",
            Stage::DeliveryComplete => "deliveryComplete",
        }
    }
}

const SINGLE_STOP_PATH: [DeliveryStatus; 7] = [
    DeliveryStatus::DriverAssigned,
    DeliveryStatus::GoingToPickup,
    DeliveryStatus::PickupArrived,
    DeliveryStatus::PackageCollected,
    DeliveryStatus::GoingToDestination,
    DeliveryStatus::AtDestination,
    DeliveryStatus::Delivered,
];

// Dropoff arrival is tracked per stop, so atDestination is not on this path.
const MULTI_STOP_PATH: [DeliveryStatus; 6] = [
    DeliveryStatus::DriverAssigned,
    DeliveryStatus::GoingToPickup,
    DeliveryStatus::PickupArrived,
    DeliveryStatus::PackageCollected,
    DeliveryStatus::GoingToDestination,
    DeliveryStatus::Delivered,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SingleStop,
    MultiStop,
}

impl Route {
    pub fn path(self) -> &'static [DeliveryStatus] {
        match self {
            Route::SingleStop => &SINGLE_STOP_PATH,
            Route::MultiStop => &MULTI_STOP_PATH,
        }
    }

    pub fn position(self, status: DeliveryStatus) -> Option<usize> {
        self.path().iter().position(|s| *s == status)
    }

    pub fn next_after(self, status: DeliveryStatus) -> Option<DeliveryStatus> {
        let index = self.position(status)?;
        self.path().get(index + 1).copied()
    }

    // Cancellation and failure are reachable from any non-terminal status.
    pub fn allows(self, from: DeliveryStatus, to: DeliveryStatus) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to.is_aborted() {
            return true;
        }
        self.next_after(from) == Some(to)
    }

    pub fn is_stop_gated(self, to: DeliveryStatus) -> bool {
        self == Route::MultiStop
            && matches!(
                to,
                DeliveryStatus::PickupArrived
                    | DeliveryStatus::PackageCollected
                    | DeliveryStatus::Delivered
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub status: DeliveryStatus,
    pub driver_id: Option<Uuid>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_stops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_index: Option<u32>,
    pub total_price: f64,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn single_stop(pickup: GeoPoint, dropoff: GeoPoint, total_price: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: DeliveryStatus::Pending,
            driver_id: None,
            pickup,
            dropoff,
            total_stops: None,
            current_stop_index: None,
            total_price,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn multi_stop(pickup: GeoPoint, dropoffs: &[GeoPoint], total_price: f64) -> Self {
        let mut delivery = Self::single_stop(
            pickup,
            dropoffs.last().copied().unwrap_or(pickup),
            total_price,
        );
        delivery.total_stops = Some(dropoffs.len() as u32 + 1);
        delivery.current_stop_index = Some(0);
        delivery
    }

    pub fn stage(&self) -> Stage {
        self.status.stage()
    }

    pub fn route(&self) -> Route {
        match self.total_stops {
            Some(stops) if stops > 1 => Route::MultiStop,
            _ => Route::SingleStop,
        }
    }

    pub fn is_multi_stop(&self) -> bool {
        self.route() == Route::MultiStop
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryPatch {
    pub status: Option<DeliveryStatus>,
    pub driver_id: Option<Uuid>,
    pub current_stop_index: Option<u32>,
    pub cancellation_reason: Option<String>,
}

impl DeliveryPatch {
    pub fn claim(driver_id: Uuid) -> Self {
        Self {
            status: Some(DeliveryStatus::DriverAssigned),
            driver_id: Some(driver_id),
            ..Self::default()
        }
    }

    pub fn status(status: DeliveryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_stop_index(mut self, index: u32) -> Self {
        self.current_stop_index = Some(index);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.cancellation_reason = Some(reason.into());
        self
    }

    pub fn apply(&self, delivery: &mut Delivery) {
        if let Some(status) = self.status {
            delivery.status = status;
        }
        if let Some(driver_id) = self.driver_id {
            delivery.driver_id = Some(driver_id);
        }
        if let Some(index) = self.current_stop_index {
            delivery.current_stop_index = Some(index);
        }
        if let Some(reason) = &self.cancellation_reason {
            delivery.cancellation_reason = Some(reason.clone());
        }
        delivery.updated_at = Utc::now();
    }
}
