use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopType {
    Pickup,
    Dropoff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StopStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StopStatus::Completed | StopStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Proof {
    pub photo_url: Option<String>,
    pub signature_url: Option<String>,
}

impl Proof {
    // Pickups need a photo; dropoffs need a photo and a signature.
    pub fn missing_for(&self, stop_type: StopType) -> Option<&'static str> {
        if !present(&self.photo_url) {
            return Some("photo");
        }
        if stop_type == StopType::Dropoff && !present(&self.signature_url) {
            return Some("signature");
        }
        None
    }
}

fn present(reference: &Option<String>) -> bool {
    reference.as_deref().is_some_and(|r| !r.trim().is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStop {
    pub delivery_id: Uuid,
    pub stop_number: u32,
    pub stop_type: StopType,
    pub status: StopStatus,
    pub location: GeoPoint,
    pub proof: Option<Proof>,
    pub failure_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryStop {
    fn new(delivery_id: Uuid, stop_number: u32, stop_type: StopType, location: GeoPoint) -> Self {
        Self {
            delivery_id,
            stop_number,
            stop_type,
            status: StopStatus::Pending,
            location,
            proof: None,
            failure_reason: None,
            completed_at: None,
        }
    }
}

pub fn build_stops(delivery_id: Uuid, pickup: GeoPoint, dropoffs: &[GeoPoint]) -> Vec<DeliveryStop> {
    std::iter::once(DeliveryStop::new(delivery_id, 1, StopType::Pickup, pickup))
        .chain(dropoffs.iter().enumerate().map(|(index, location)| {
            DeliveryStop::new(delivery_id, index as u32 + 2, StopType::Dropoff, *location)
        }))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct StopPatch {
    pub status: Option<StopStatus>,
    pub proof: Option<Proof>,
    pub failure_reason: Option<String>,
}

impl StopPatch {
    pub fn arrived() -> Self {
        Self {
            status: Some(StopStatus::InProgress),
            ..Self::default()
        }
    }

    pub fn completed(proof: Proof) -> Self {
        Self {
            status: Some(StopStatus::Completed),
            proof: Some(proof),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(StopStatus::Failed),
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn apply(&self, stop: &mut DeliveryStop) {
        if let Some(status) = self.status {
            stop.status = status;
            if status.is_terminal() {
                stop.completed_at = Some(Utc::now());
            }
        }
        if let Some(proof) = &self.proof {
            stop.proof = Some(proof.clone());
        }
        if let Some(reason) = &self.failure_reason {
            stop.failure_reason = Some(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{build_stops, Proof, StopStatus, StopType};
    use crate::models::location::GeoPoint;

    fn point(lat: f64) -> GeoPoint {
        GeoPoint { lat, lng: 13.4 }
    }

    #[test]
    fn pickup_is_stop_one_followed_by_dropoffs() {
        let stops = build_stops(Uuid::new_v4(), point(52.50), &[point(52.51), point(52.52)]);

        assert_eq!(stops.len(), 3);
        assert_eq!(stops[0].stop_number, 1);
        assert_eq!(stops[0].stop_type, StopType::Pickup);
        assert_eq!(stops[2].stop_number, 3);
        assert_eq!(stops[2].stop_type, StopType::Dropoff);
        assert!(stops.iter().all(|s| s.status == StopStatus::Pending));
    }

    #[test]
    fn dropoff_proof_requires_signature() {
        let photo_only = Proof {
            photo_url: Some("s3://proof/photo.jpg".to_string()),
            signature_url: None,
        };

        assert_eq!(photo_only.missing_for(StopType::Pickup), None);
        assert_eq!(photo_only.missing_for(StopType::Dropoff), Some("signature"));
    }

    #[test]
    fn blank_references_count_as_absent() {
        let blank = Proof {
            photo_url: Some("   ".to_string()),
            signature_url: Some("sig.png".to_string()),
        };
        assert_eq!(blank.missing_for(StopType::Dropoff), Some("photo"));
    }
}
