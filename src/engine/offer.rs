use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant as TokioInstant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::session::SessionRegistry;
use crate::engine::watch::JobChannels;
use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
use crate::models::offer::{OfferOutcome, OfferSnapshot};
use crate::observability::metrics::Metrics;
use crate::realtime::{NotificationSink, PublishResult, StatusNote};
use crate::store::{RecordStore, UpdateOutcome};

const TICK: Duration = Duration::from_secs(1);

const OPEN: u8 = 0;
const CLAIMING: u8 = 1;
const ACCEPTED: u8 = 2;
const DECLINED: u8 = 3;
const EXPIRED: u8 = 4;

fn phase_of(outcome: OfferOutcome) -> u8 {
    match outcome {
        OfferOutcome::Accepted => ACCEPTED,
        OfferOutcome::Declined => DECLINED,
        OfferOutcome::Expired => EXPIRED,
    }
}

fn outcome_of(phase: u8) -> Option<OfferOutcome> {
    match phase {
        ACCEPTED => Some(OfferOutcome::Accepted),
        DECLINED => Some(OfferOutcome::Declined),
        EXPIRED => Some(OfferOutcome::Expired),
        _ => None,
    }
}

enum Tick {
    Running,
    Paused,
    Elapsed,
    Resolved,
}

struct OfferInner {
    id: Uuid,
    delivery_id: Uuid,
    driver_id: Uuid,
    offered_status: DeliveryStatus,
    window: Duration,
    remaining: AtomicU64,
    phase: AtomicU8,
    outcome_tx: watch::Sender<Option<OfferOutcome>>,
}

#[derive(Clone)]
pub struct Offer {
    inner: Arc<OfferInner>,
}

impl Offer {
    fn new(delivery: &Delivery, driver_id: Uuid, window: Duration) -> Self {
        let (outcome_tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(OfferInner {
                id: Uuid::new_v4(),
                delivery_id: delivery.id,
                driver_id,
                offered_status: delivery.status,
                window,
                remaining: AtomicU64::new(window.as_secs()),
                phase: AtomicU8::new(OPEN),
                outcome_tx,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn delivery_id(&self) -> Uuid {
        self.inner.delivery_id
    }

    pub fn driver_id(&self) -> Uuid {
        self.inner.driver_id
    }

    pub fn remaining_secs(&self) -> u64 {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.phase.load(Ordering::SeqCst) == CLAIMING
    }

    pub fn outcome(&self) -> Option<OfferOutcome> {
        outcome_of(self.inner.phase.load(Ordering::SeqCst))
    }

    pub async fn resolved(&self) -> OfferOutcome {
        let mut rx = self.inner.outcome_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(OfferOutcome::Expired),
            // The sender lives in `self`, so this only happens during teardown.
            Err(_) => self.outcome().unwrap_or(OfferOutcome::Expired),
        }
    }

    pub fn snapshot(&self) -> OfferSnapshot {
        OfferSnapshot {
            id: self.inner.id,
            delivery_id: self.inner.delivery_id,
            driver_id: self.inner.driver_id,
            window_secs: self.inner.window.as_secs(),
            remaining_secs: self.remaining_secs(),
            paused: self.is_paused(),
            outcome: self.outcome(),
        }
    }

    fn closed_error(phase: u8) -> AppError {
        match outcome_of(phase) {
            Some(outcome) => AppError::OfferClosed(outcome),
            None => AppError::ClaimInFlight,
        }
    }

    fn begin_claim(&self) -> Result<(), AppError> {
        self.inner
            .phase
            .compare_exchange(OPEN, CLAIMING, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Self::closed_error)
    }

    fn resume(&self) {
        let _ = self.inner.phase.compare_exchange(
            CLAIMING,
            OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn resolve(&self, from: u8, outcome: OfferOutcome) -> Result<(), AppError> {
        self.inner
            .phase
            .compare_exchange(from, phase_of(outcome), Ordering::SeqCst, Ordering::SeqCst)
            .map_err(Self::closed_error)?;
        self.inner.outcome_tx.send_replace(Some(outcome));
        Ok(())
    }

    fn tick(&self) -> Tick {
        match self.inner.phase.load(Ordering::SeqCst) {
            OPEN => {
                let left = self
                    .inner
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
                    .map(|previous| previous - 1)
                    .unwrap_or(0);
                if left > 0 {
                    return Tick::Running;
                }
                match self.resolve(OPEN, OfferOutcome::Expired) {
                    Ok(()) => Tick::Elapsed,
                    Err(AppError::ClaimInFlight) => Tick::Paused,
                    Err(_) => Tick::Resolved,
                }
            }
            CLAIMING => Tick::Paused,
            _ => Tick::Resolved,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Assigned { delivery: Delivery },
    AlreadyTaken { current: DeliveryStatus },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeclineAck {
    pub offer_id: Uuid,
    pub outcome: OfferOutcome,
    pub publish: PublishResult,
}

#[derive(Clone)]
pub struct OfferArbiter {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    sessions: Arc<SessionRegistry>,
    channels: JobChannels,
    offers: Arc<DashMap<Uuid, Offer>>,
    metrics: Metrics,
}

impl OfferArbiter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        sessions: Arc<SessionRegistry>,
        channels: JobChannels,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            sink,
            sessions,
            channels,
            offers: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub fn start_offer(&self, delivery: &Delivery, driver_id: Uuid, window: Duration) -> Result<Offer, AppError> {
        if !delivery.status.is_claimable() {
            return Err(AppError::Conflict(format!(
                "delivery {} is {}, not open for offers",
                delivery.id, delivery.status
            )));
        }
        if window.as_secs() == 0 {
            return Err(AppError::BadRequest("offer window must be at least one second".to_string()));
        }
        self.sessions.get(driver_id)?;

        let offer = Offer::new(delivery, driver_id, window);
        self.offers.insert(offer.id(), offer.clone());
        self.metrics.offers_active.inc();
        self.spawn_countdown(offer.clone());

        info!(
            offer_id = %offer.id(),
            delivery_id = %delivery.id,
            driver_id = %driver_id,
            window_secs = window.as_secs(),
            "offer started"
        );
        Ok(offer)
    }

    pub fn get(&self, offer_id: Uuid) -> Result<Offer, AppError> {
        self.offers
            .get(&offer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))
    }

    pub fn active_offers(&self) -> usize {
        self.offers.len()
    }

    // `AlreadyTaken` and transient errors leave the offer open with its
    // countdown resumed.
    pub async fn accept(&self, offer: &Offer) -> Result<ClaimOutcome, AppError> {
        let driver_id = offer.driver_id();
        let delivery_id = offer.delivery_id();
        self.sessions.get(driver_id)?;
        let reserved = self.sessions.reserve(driver_id, delivery_id)?;
        let release = || {
            if reserved {
                self.sessions.release(driver_id, delivery_id);
            }
        };

        if let Err(err) = offer.begin_claim() {
            release();
            return Err(err);
        }

        let start = Instant::now();
        let result = self
            .store
            .conditional_update(
                offer.delivery_id(),
                &[DeliveryStatus::Offered, DeliveryStatus::Pending],
                DeliveryPatch::claim(driver_id),
            )
            .await;
        self.metrics
            .operation_latency_seconds
            .with_label_values(&["claim"])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(UpdateOutcome::Applied(delivery)) => {
                offer.resolve(CLAIMING, OfferOutcome::Accepted)?;
                self.retire(offer);
                self.metrics.claims_total.with_label_values(&["assigned"]).inc();

                info!(
                    offer_id = %offer.id(),
                    delivery_id = %delivery.id,
                    driver_id = %driver_id,
                    "delivery assigned"
                );

                let note = StatusNote::new(delivery.id, delivery.status)
                    .with_note(format!("assigned to driver {driver_id}"));
                if let PublishResult::Failed(reason) = self.sink.publish(note).await {
                    warn!(delivery_id = %delivery.id, reason = %reason, "status publish failed");
                }
                if let Err(err) = self.channels.open(&delivery).await {
                    warn!(delivery_id = %delivery.id, error = %err, "failed to open job channels");
                }

                Ok(ClaimOutcome::Assigned { delivery })
            }
            Ok(UpdateOutcome::Rejected { current }) => {
                offer.resume();
                release();
                self.metrics
                    .claims_total
                    .with_label_values(&["already_taken"])
                    .inc();
                info!(
                    offer_id = %offer.id(),
                    delivery_id = %offer.delivery_id(),
                    current = %current,
                    "delivery already taken"
                );
                Ok(ClaimOutcome::AlreadyTaken { current })
            }
            Err(err) => {
                offer.resume();
                release();
                self.metrics.claims_total.with_label_values(&["transient"]).inc();
                warn!(
                    offer_id = %offer.id(),
                    delivery_id = %offer.delivery_id(),
                    error = %err,
                    "claim failed"
                );
                Err(err.into())
            }
        }
    }

    pub async fn decline(&self, offer: &Offer) -> Result<DeclineAck, AppError> {
        offer.resolve(OPEN, OfferOutcome::Declined)?;
        self.retire(offer);

        info!(
            offer_id = %offer.id(),
            delivery_id = %offer.delivery_id(),
            driver_id = %offer.driver_id(),
            "offer declined"
        );

        let note = StatusNote::new(offer.delivery_id(), offer.inner.offered_status)
            .with_note(format!("declined by driver {}", offer.driver_id()));
        let publish = self.sink.publish(note).await;
        if let PublishResult::Failed(reason) = &publish {
            warn!(offer_id = %offer.id(), reason = %reason, "decline notification failed");
        }

        Ok(DeclineAck {
            offer_id: offer.id(),
            outcome: OfferOutcome::Declined,
            publish,
        })
    }

    fn retire(&self, offer: &Offer) {
        if self.offers.remove(&offer.id()).is_some() {
            self.metrics.offers_active.dec();
        }
    }

    fn spawn_countdown(&self, offer: Offer) {
        let arbiter = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(TokioInstant::now() + TICK, TICK);
            loop {
                ticks.tick().await;
                match offer.tick() {
                    Tick::Running | Tick::Paused => continue,
                    Tick::Elapsed => {
                        arbiter.expired(&offer).await;
                        break;
                    }
                    Tick::Resolved => break,
                }
            }
        });
    }

    async fn expired(&self, offer: &Offer) {
        self.retire(offer);
        info!(
            offer_id = %offer.id(),
            delivery_id = %offer.delivery_id(),
            driver_id = %offer.driver_id(),
            "offer expired"
        );

        let note = StatusNote::new(offer.delivery_id(), offer.inner.offered_status)
            .with_note(format!("offer to driver {} expired", offer.driver_id()));
        if let PublishResult::Failed(reason) = self.sink.publish(note).await {
            warn!(offer_id = %offer.id(), reason = %reason, "expiry notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::{Offer, Tick, CLAIMING, OPEN};
    use crate::error::AppError;
    use crate::models::delivery::Delivery;
    use crate::models::location::GeoPoint;
    use crate::models::offer::OfferOutcome;

    fn offer(window_secs: u64) -> Offer {
        let delivery = Delivery::single_stop(
            GeoPoint { lat: 52.51, lng: 13.39 },
            GeoPoint { lat: 52.54, lng: 13.42 },
            9.90,
        );
        Offer::new(&delivery, Uuid::new_v4(), Duration::from_secs(window_secs))
    }

    #[test]
    fn ticks_down_then_expires() {
        let offer = offer(2);
        assert!(matches!(offer.tick(), Tick::Running));
        assert_eq!(offer.remaining_secs(), 1);
        assert!(matches!(offer.tick(), Tick::Elapsed));
        assert_eq!(offer.outcome(), Some(OfferOutcome::Expired));
        assert!(matches!(offer.tick(), Tick::Resolved));
    }

    #[test]
    fn claim_pauses_the_countdown() {
        let offer = offer(5);
        offer.begin_claim().unwrap();
        assert!(matches!(offer.tick(), Tick::Paused));
        assert_eq!(offer.remaining_secs(), 5);
        assert!(matches!(offer.begin_claim(), Err(AppError::ClaimInFlight)));

        offer.resume();
        assert!(matches!(offer.tick(), Tick::Running));
        assert_eq!(offer.remaining_secs(), 4);
    }

    #[test]
    fn resolves_exactly_once() {
        let offer = offer(5);
        offer.resolve(OPEN, OfferOutcome::Declined).unwrap();
        assert!(matches!(
            offer.resolve(OPEN, OfferOutcome::Expired),
            Err(AppError::OfferClosed(OfferOutcome::Declined))
        ));
        assert!(matches!(
            offer.resolve(CLAIMING, OfferOutcome::Accepted),
            Err(AppError::OfferClosed(OfferOutcome::Declined))
        ));
        assert_eq!(offer.snapshot().outcome, Some(OfferOutcome::Declined));
    }
}
