use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::reconcile::Teardown;
use crate::error::AppError;
use crate::geo::{haversine_km, is_valid};
use crate::models::delivery::{Delivery, Stage};
use crate::models::event::RealtimeEvent;
use crate::models::location::GeoPoint;
use crate::models::stop::DeliveryStop;

pub struct TrackingChannel {
    pub delivery_id: Uuid,
    pub driver_id: Uuid,
    closed: AtomicBool,
    pings: AtomicU64,
}

impl TrackingChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }
}

impl Teardown for TrackingChannel {
    fn teardown(&self) -> Result<(), String> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err("tracking channel already closed".to_string());
        }
        Ok(())
    }
}

pub struct LocationTracker {
    events_tx: broadcast::Sender<RealtimeEvent>,
    channels: DashMap<Uuid, Arc<TrackingChannel>>,
}

impl LocationTracker {
    pub fn new(events_tx: broadcast::Sender<RealtimeEvent>) -> Self {
        Self {
            events_tx,
            channels: DashMap::new(),
        }
    }

    pub fn open(&self, delivery_id: Uuid, driver_id: Uuid) -> Arc<TrackingChannel> {
        let channel = Arc::new(TrackingChannel {
            delivery_id,
            driver_id,
            closed: AtomicBool::new(false),
            pings: AtomicU64::new(0),
        });
        self.channels.insert(delivery_id, channel.clone());
        channel
    }

    pub fn is_open(&self, delivery_id: Uuid) -> bool {
        self.channels
            .get(&delivery_id)
            .is_some_and(|channel| !channel.is_closed())
    }

    pub fn ping(
        &self,
        delivery_id: Uuid,
        driver_id: Uuid,
        location: GeoPoint,
        target: GeoPoint,
    ) -> Result<RealtimeEvent, AppError> {
        if !is_valid(&location) {
            return Err(AppError::BadRequest("location out of range".to_string()));
        }

        let channel = self
            .channels
            .get(&delivery_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                AppError::NotFound(format!("no tracking channel for delivery {delivery_id}"))
            })?;

        if channel.is_closed() {
            self.channels.remove(&delivery_id);
            return Err(AppError::Conflict(format!(
                "delivery {delivery_id} is no longer active"
            )));
        }
        if channel.driver_id != driver_id {
            return Err(AppError::BadRequest(format!(
                "driver {driver_id} is not assigned to delivery {delivery_id}"
            )));
        }

        let event = RealtimeEvent::Location {
            delivery_id,
            driver_id,
            location,
            distance_to_stop_km: haversine_km(&location, &target),
            at: Utc::now(),
        };
        channel.pings.fetch_add(1, Ordering::SeqCst);
        let _ = self.events_tx.send(event.clone());
        Ok(event)
    }
}

pub fn tracking_target(delivery: &Delivery, stops: &[DeliveryStop]) -> GeoPoint {
    let current_stop = delivery
        .current_stop_index
        .and_then(|index| stops.get(index as usize));
    if let Some(stop) = current_stop {
        return stop.location;
    }
    match delivery.stage() {
        Stage::HeadingToPickup => delivery.pickup,
        Stage::HeadingToDelivery | Stage::DeliveryComplete => delivery.dropoff,
    }
}
