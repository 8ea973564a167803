pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
use crate::models::stop::{DeliveryStop, StopPatch, StopStatus};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("delivery {0} not found")]
    NotFound(Uuid),

    #[error("stop {stop_number} of delivery {delivery_id} not found")]
    StopNotFound { delivery_id: Uuid, stop_number: u32 },
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Applied(Delivery),
    Rejected { current: DeliveryStatus },
}

#[derive(Debug, Clone)]
pub enum StopUpdateOutcome {
    Applied(DeliveryStop),
    Rejected { current: StopStatus },
}

pub type SnapshotStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, delivery: Delivery, stops: Vec<DeliveryStop>) -> Result<(), StoreError>;

    async fn read(&self, id: Uuid) -> Result<Delivery, StoreError>;

    // Applies `patch` only if the record's status is one of `expected`.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &[DeliveryStatus],
        patch: DeliveryPatch,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn read_stops(&self, id: Uuid) -> Result<Vec<DeliveryStop>, StoreError>;

    async fn conditional_update_stop(
        &self,
        id: Uuid,
        stop_number: u32,
        expected: StopStatus,
        patch: StopPatch,
    ) -> Result<StopUpdateOutcome, StoreError>;

    async fn subscribe(&self, id: Uuid) -> Result<SnapshotStream, StoreError>;
}
