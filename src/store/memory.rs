use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
use crate::models::stop::{DeliveryStop, StopPatch, StopStatus};
use crate::store::{RecordStore, SnapshotStream, StopUpdateOutcome, StoreError, UpdateOutcome};

const SNAPSHOT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Insert,
    Read,
    ConditionalUpdate,
    ReadStops,
    ConditionalUpdateStop,
    Subscribe,
}

// Compare-and-set runs under the per-key write guard of the map, so at
// most one of several racing updates applies.
#[derive(Default)]
pub struct InMemoryStore {
    deliveries: DashMap<Uuid, Delivery>,
    stops: DashMap<Uuid, Vec<DeliveryStop>>,
    feeds: DashMap<Uuid, broadcast::Sender<Delivery>>,
    failing: DashSet<StoreOp>,
    calls: DashMap<StoreOp, u64>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn inject_failure(&self, op: StoreOp) {
        self.failing.insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.clear();
    }

    pub fn calls(&self, op: StoreOp) -> u64 {
        self.calls.get(&op).map(|count| *count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn force_status(&self, id: Uuid, status: DeliveryStatus) -> Result<Delivery, StoreError> {
        let snapshot = {
            let mut delivery = self
                .deliveries
                .get_mut(&id)
                .ok_or(StoreError::NotFound(id))?;
            DeliveryPatch::status(status).apply(&mut delivery);
            delivery.clone()
        };
        self.publish(snapshot.clone());
        Ok(snapshot)
    }

    async fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.contains(&op) {
            return Err(StoreError::Unavailable(format!("injected failure for {op:?}")));
        }
        Ok(())
    }

    fn publish(&self, snapshot: Delivery) {
        if let Some(feed) = self.feeds.get(&snapshot.id) {
            let _ = feed.send(snapshot);
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert(&self, delivery: Delivery, mut stops: Vec<DeliveryStop>) -> Result<(), StoreError> {
        self.enter(StoreOp::Insert).await?;

        stops.sort_by_key(|stop| stop.stop_number);
        if !stops.is_empty() {
            self.stops.insert(delivery.id, stops);
        }
        self.deliveries.insert(delivery.id, delivery);
        Ok(())
    }

    async fn read(&self, id: Uuid) -> Result<Delivery, StoreError> {
        self.enter(StoreOp::Read).await?;

        self.deliveries
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &[DeliveryStatus],
        patch: DeliveryPatch,
    ) -> Result<UpdateOutcome, StoreError> {
        self.enter(StoreOp::ConditionalUpdate).await?;

        let snapshot = {
            let mut delivery = self
                .deliveries
                .get_mut(&id)
                .ok_or(StoreError::NotFound(id))?;
            if !expected.contains(&delivery.status) {
                return Ok(UpdateOutcome::Rejected {
                    current: delivery.status,
                });
            }
            patch.apply(&mut delivery);
            delivery.clone()
        };

        self.publish(snapshot.clone());
        Ok(UpdateOutcome::Applied(snapshot))
    }

    async fn read_stops(&self, id: Uuid) -> Result<Vec<DeliveryStop>, StoreError> {
        self.enter(StoreOp::ReadStops).await?;

        if !self.deliveries.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(self
            .stops
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn conditional_update_stop(
        &self,
        id: Uuid,
        stop_number: u32,
        expected: StopStatus,
        patch: StopPatch,
    ) -> Result<StopUpdateOutcome, StoreError> {
        self.enter(StoreOp::ConditionalUpdateStop).await?;

        let mut stops = self.stops.get_mut(&id).ok_or(StoreError::StopNotFound {
            delivery_id: id,
            stop_number,
        })?;
        let stop = stops
            .iter_mut()
            .find(|stop| stop.stop_number == stop_number)
            .ok_or(StoreError::StopNotFound {
                delivery_id: id,
                stop_number,
            })?;

        if stop.status != expected {
            return Ok(StopUpdateOutcome::Rejected {
                current: stop.status,
            });
        }
        patch.apply(stop);
        Ok(StopUpdateOutcome::Applied(stop.clone()))
    }

    async fn subscribe(&self, id: Uuid) -> Result<SnapshotStream, StoreError> {
        self.enter(StoreOp::Subscribe).await?;

        if !self.deliveries.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let rx = self
            .feeds
            .entry(id)
            .or_insert_with(|| broadcast::channel(SNAPSHOT_BUFFER).0)
            .subscribe();

        // Lagging subscribers skip ahead; the next snapshot is a re-read cue anyway.
        let stream = BroadcastStream::new(rx).filter_map(|result| result.ok());
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{InMemoryStore, StoreOp};
    use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
    use crate::models::location::GeoPoint;
    use crate::store::{RecordStore, StoreError, UpdateOutcome};

    fn delivery() -> Delivery {
        Delivery::single_stop(
            GeoPoint { lat: 52.51, lng: 13.39 },
            GeoPoint { lat: 52.54, lng: 13.42 },
            18.50,
        )
    }

    #[tokio::test]
    async fn conditional_update_rejects_unexpected_status() {
        let store = InMemoryStore::new();
        let d = delivery();
        let id = d.id;
        store.insert(d, Vec::new()).await.unwrap();

        let outcome = store
            .conditional_update(
                id,
                &[DeliveryStatus::GoingToPickup],
                DeliveryPatch::status(DeliveryStatus::PickupArrived),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            UpdateOutcome::Rejected {
                current: DeliveryStatus::Pending
            }
        ));
        assert_eq!(store.read(id).await.unwrap().status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn only_one_of_many_racing_claims_applies() {
        let store = Arc::new(InMemoryStore::new());
        let d = delivery();
        let id = d.id;
        store.insert(d, Vec::new()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .conditional_update(
                        id,
                        &[DeliveryStatus::Pending, DeliveryStatus::Offered],
                        DeliveryPatch::claim(uuid::Uuid::new_v4()),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), UpdateOutcome::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_unavailable() {
        let store = InMemoryStore::new();
        store.inject_failure(StoreOp::Read);

        let err = store.read(uuid::Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls(StoreOp::Read), 1);
    }
}
