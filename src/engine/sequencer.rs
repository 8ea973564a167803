use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::progression::{AdvanceOutcome, ProgressionEngine};
use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
use crate::models::stop::{DeliveryStop, Proof, StopPatch, StopStatus, StopType};
use crate::store::StopUpdateOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    Applied {
        stop: DeliveryStop,
        delivery: Delivery,
    },
    Stale { current: StopStatus },
    ParentStale { current: DeliveryStatus },
    Terminal { current: DeliveryStatus },
}

pub struct MultiStopSequencer {
    engine: ProgressionEngine,
    delivery: Delivery,
    stops: Vec<DeliveryStop>,
}

impl MultiStopSequencer {
    pub async fn load(engine: ProgressionEngine, delivery_id: uuid::Uuid) -> Result<Self, AppError> {
        let delivery = engine.store().read(delivery_id).await?;
        if !delivery.is_multi_stop() {
            return Err(AppError::Precondition(format!(
                "delivery {delivery_id} has a single stop"
            )));
        }

        let mut stops = engine.store().read_stops(delivery_id).await?;
        stops.sort_by_key(|stop| stop.stop_number);
        if let Err(err) = check_stop_layout(&delivery, &stops) {
            error!(delivery_id = %delivery_id, error = %err, "stop layout does not match delivery");
            return Err(err);
        }

        Ok(Self {
            engine,
            delivery,
            stops,
        })
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn current_stop(&self) -> Option<&DeliveryStop> {
        self.stops.get(self.cursor() as usize)
    }

    pub async fn arrive_at_stop(&mut self, stop_number: u32) -> Result<StopOutcome, AppError> {
        let index = self.index_of(stop_number)?;
        self.ensure_in_sequence(index)?;
        if self.stops[index].status == StopStatus::InProgress {
            return self.catch_up(index).await;
        }
        self.ensure_status(index, StopStatus::Pending, StopStatus::InProgress)?;

        let parent = self.refresh_parent().await?;
        if parent.is_terminal() {
            return Ok(StopOutcome::Terminal { current: parent });
        }
        let required = match self.stops[index].stop_type {
            StopType::Pickup => DeliveryStatus::GoingToPickup,
            StopType::Dropoff => DeliveryStatus::GoingToDestination,
        };
        if parent != required {
            return Err(AppError::Precondition(format!(
                "stop {stop_number} can only be reached while the delivery is {required}, it is {parent}"
            )));
        }

        if let Some(stale) = self
            .record_stop(index, StopStatus::Pending, StopPatch::arrived())
            .await?
        {
            return Ok(stale);
        }
        let outcome = self.advance_delivery().await?;
        Ok(self.fold(index, outcome))
    }

    pub async fn complete_stop(&mut self, stop_number: u32, proof: Proof) -> Result<StopOutcome, AppError> {
        let index = self.index_of(stop_number)?;
        self.ensure_in_sequence(index)?;
        if self.stops[index].status == StopStatus::Completed {
            return self.catch_up(index).await;
        }
        self.ensure_status(index, StopStatus::InProgress, StopStatus::Completed)?;
        if let Some(artifact) = proof.missing_for(self.stops[index].stop_type) {
            return Err(AppError::MissingProof {
                stop_number,
                artifact,
            });
        }

        self.settle(index, StopPatch::completed(proof)).await
    }

    pub async fn fail_stop(&mut self, stop_number: u32, reason: &str) -> Result<StopOutcome, AppError> {
        let index = self.index_of(stop_number)?;
        self.ensure_in_sequence(index)?;
        if self.stops[index].status == StopStatus::Failed {
            return self.catch_up(index).await;
        }
        self.ensure_status(index, StopStatus::InProgress, StopStatus::Failed)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Precondition(format!(
                "failing stop {stop_number} requires a reason"
            )));
        }

        self.settle(index, StopPatch::failed(reason)).await
    }

    // Once every stop is settled the delivery is delivered, whatever the
    // individual stop results.
    pub async fn advance_delivery(&mut self) -> Result<AdvanceOutcome, AppError> {
        while let Some(next) = self.gated_step() {
            let expected = self.delivery.status;
            let patch = DeliveryPatch::status(next).with_stop_index(self.cursor());
            let note = (next == DeliveryStatus::Delivered).then(|| self.summary());

            let outcome = self
                .engine
                .transition(self.delivery.id, expected, patch, note)
                .await?;
            match outcome {
                AdvanceOutcome::Applied { delivery } => self.delivery = delivery,
                other => return Ok(other),
            }
        }

        let cursor = self.cursor();
        if self.delivery.current_stop_index == Some(cursor) || self.delivery.status.is_terminal() {
            return Ok(AdvanceOutcome::Applied {
                delivery: self.delivery.clone(),
            });
        }

        let outcome = self
            .engine
            .transition(
                self.delivery.id,
                self.delivery.status,
                DeliveryPatch::default().with_stop_index(cursor),
                None,
            )
            .await?;
        if let AdvanceOutcome::Applied { delivery } = &outcome {
            self.delivery = delivery.clone();
        }
        Ok(outcome)
    }

    async fn settle(&mut self, index: usize, patch: StopPatch) -> Result<StopOutcome, AppError> {
        let parent = self.refresh_parent().await?;
        if parent.is_terminal() {
            return Ok(StopOutcome::Terminal { current: parent });
        }

        if let Some(stale) = self
            .record_stop(index, StopStatus::InProgress, patch)
            .await?
        {
            return Ok(stale);
        }
        let outcome = self.advance_delivery().await?;
        Ok(self.fold(index, outcome))
    }

    async fn catch_up(&mut self, index: usize) -> Result<StopOutcome, AppError> {
        let parent = self.refresh_parent().await?;
        if parent.is_terminal() {
            return Ok(StopOutcome::Terminal { current: parent });
        }
        let outcome = self.advance_delivery().await?;
        Ok(self.fold(index, outcome))
    }

    // The stop-gated parent transition the stops currently call for.
    fn gated_step(&self) -> Option<DeliveryStatus> {
        let pickup = self.stops.first()?.status;
        match self.delivery.status {
            DeliveryStatus::GoingToPickup if pickup != StopStatus::Pending => {
                Some(DeliveryStatus::PickupArrived)
            }
            DeliveryStatus::PickupArrived if pickup.is_terminal() => {
                Some(DeliveryStatus::PackageCollected)
            }
            DeliveryStatus::GoingToDestination
                if self.stops.iter().all(|stop| stop.status.is_terminal()) =>
            {
                Some(DeliveryStatus::Delivered)
            }
            _ => None,
        }
    }

    fn cursor(&self) -> u32 {
        self.stops
            .iter()
            .position(|stop| !stop.status.is_terminal())
            .unwrap_or(self.stops.len()) as u32
    }

    fn summary(&self) -> String {
        let completed = self
            .stops
            .iter()
            .filter(|stop| stop.status == StopStatus::Completed)
            .count();
        format!("{completed} of {} stops completed", self.stops.len())
    }

    fn index_of(&self, stop_number: u32) -> Result<usize, AppError> {
        if stop_number == 0 || stop_number as usize > self.stops.len() {
            return Err(AppError::Invariant(format!(
                "stop {stop_number} is outside 1..={} for delivery {}",
                self.stops.len(),
                self.delivery.id
            )));
        }
        Ok(stop_number as usize - 1)
    }

    fn ensure_in_sequence(&self, index: usize) -> Result<(), AppError> {
        match self.stops[..index]
            .iter()
            .find(|stop| !stop.status.is_terminal())
        {
            Some(blocking) => Err(AppError::OutOfOrder {
                stop_number: self.stops[index].stop_number,
                blocking: blocking.stop_number,
            }),
            None => Ok(()),
        }
    }

    fn ensure_status(&self, index: usize, from: StopStatus, to: StopStatus) -> Result<(), AppError> {
        let stop = &self.stops[index];
        if stop.status != from {
            return Err(AppError::InvalidStopTransition {
                stop_number: stop.stop_number,
                from: stop.status,
                to,
            });
        }
        Ok(())
    }

    async fn refresh_parent(&mut self) -> Result<DeliveryStatus, AppError> {
        self.delivery = self.engine.store().read(self.delivery.id).await?;
        Ok(self.delivery.status)
    }

    async fn record_stop(
        &mut self,
        index: usize,
        expected: StopStatus,
        patch: StopPatch,
    ) -> Result<Option<StopOutcome>, AppError> {
        let stop_number = self.stops[index].stop_number;
        let metrics = self.engine.metrics().clone();

        let outcome = match self
            .engine
            .store()
            .conditional_update_stop(self.delivery.id, stop_number, expected, patch)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                metrics.stop_updates_total.with_label_values(&["error"]).inc();
                return Err(err.into());
            }
        };

        match outcome {
            StopUpdateOutcome::Applied(stop) => {
                metrics.stop_updates_total.with_label_values(&["applied"]).inc();
                info!(
                    delivery_id = %self.delivery.id,
                    stop_number,
                    status = ?stop.status,
                    "stop updated"
                );
                self.stops[index] = stop;
                Ok(None)
            }
            StopUpdateOutcome::Rejected { current } => {
                metrics.stop_updates_total.with_label_values(&["stale"]).inc();
                warn!(
                    delivery_id = %self.delivery.id,
                    stop_number,
                    current = ?current,
                    "stale stop update rejected"
                );
                self.stops[index].status = current;
                Ok(Some(StopOutcome::Stale { current }))
            }
        }
    }

    fn fold(&self, index: usize, outcome: AdvanceOutcome) -> StopOutcome {
        match outcome {
            AdvanceOutcome::Applied { delivery } => StopOutcome::Applied {
                stop: self.stops[index].clone(),
                delivery,
            },
            AdvanceOutcome::Stale { current } => StopOutcome::ParentStale { current },
            AdvanceOutcome::Terminal { current } => StopOutcome::Terminal { current },
        }
    }
}

fn check_stop_layout(delivery: &Delivery, stops: &[DeliveryStop]) -> Result<(), AppError> {
    let expected = delivery.total_stops.unwrap_or(0) as usize;
    if stops.len() != expected {
        return Err(AppError::Invariant(format!(
            "delivery {} declares {expected} stops but has {}",
            delivery.id,
            stops.len()
        )));
    }
    for (index, stop) in stops.iter().enumerate() {
        let expected_type = if index == 0 {
            StopType::Pickup
        } else {
            StopType::Dropoff
        };
        if stop.stop_number as usize != index + 1 || stop.stop_type != expected_type {
            return Err(AppError::Invariant(format!(
                "delivery {} has stop {} of type {:?} at position {}",
                delivery.id,
                stop.stop_number,
                stop.stop_type,
                index + 1
            )));
        }
    }
    Ok(())
}
