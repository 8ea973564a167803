use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OfferOutcome {
    Accepted,
    Declined,
    Expired,
}

impl OfferOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            OfferOutcome::Accepted => "accepted",
            OfferOutcome::Declined => "declined",
            OfferOutcome::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferSnapshot {
    pub id: Uuid,
    pub delivery_id: Uuid,
    pub driver_id: Uuid,
    pub window_secs: u64,
    pub remaining_secs: u64,
    pub paused: bool,
    pub outcome: Option<OfferOutcome>,
}
