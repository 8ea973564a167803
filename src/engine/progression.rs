use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::reconcile::Reconciler;
use crate::error::AppError;
use crate::models::delivery::{Delivery, DeliveryPatch, DeliveryStatus};
use crate::observability::metrics::Metrics;
use crate::realtime::{NotificationSink, PublishResult, StatusNote};
use crate::store::{RecordStore, UpdateOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Applied { delivery: Delivery },
    Stale { current: DeliveryStatus },
    Terminal { current: DeliveryStatus },
}

impl AdvanceOutcome {
    fn label(&self) -> &'static str {
        match self {
            AdvanceOutcome::Applied { .. } => "applied",
            AdvanceOutcome::Stale { .. } => "stale",
            AdvanceOutcome::Terminal { .. } => "terminal",
        }
    }
}

#[derive(Clone)]
pub struct ProgressionEngine {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    reconciler: Reconciler,
    metrics: Metrics,
}

impl ProgressionEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        reconciler: Reconciler,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            sink,
            reconciler,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn advance(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
        next: DeliveryStatus,
    ) -> Result<AdvanceOutcome, AppError> {
        let route = delivery.route();
        if !route.allows(expected, next) {
            return Err(AppError::InvalidTransition {
                from: expected,
                to: next,
            });
        }
        if route.is_stop_gated(next) {
            return Err(AppError::Precondition(format!(
                "{next} is entered by completing stops on a multi-stop delivery"
            )));
        }

        self.transition(delivery.id, expected, DeliveryPatch::status(next), None)
            .await
    }

    pub async fn cancel(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
        reason: &str,
    ) -> Result<AdvanceOutcome, AppError> {
        self.abort(delivery, expected, DeliveryStatus::Cancelled, reason)
            .await
    }

    pub async fn fail(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
        reason: &str,
    ) -> Result<AdvanceOutcome, AppError> {
        self.abort(delivery, expected, DeliveryStatus::Failed, reason)
            .await
    }

    async fn abort(
        &self,
        delivery: &Delivery,
        expected: DeliveryStatus,
        target: DeliveryStatus,
        reason: &str,
    ) -> Result<AdvanceOutcome, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Precondition(format!("{target} requires a reason")));
        }
        if !delivery.route().allows(expected, target) {
            return Err(AppError::InvalidTransition {
                from: expected,
                to: target,
            });
        }

        let patch = DeliveryPatch::status(target).with_reason(reason);
        self.transition(delivery.id, expected, patch, Some(reason.to_string()))
            .await
    }

    pub(crate) async fn transition(
        &self,
        id: Uuid,
        expected: DeliveryStatus,
        patch: DeliveryPatch,
        note: Option<String>,
    ) -> Result<AdvanceOutcome, AppError> {
        let operation = if patch.status.is_some() {
            "advance"
        } else {
            "move_cursor"
        };
        let next = patch.status;
        let closing = next.is_some_and(DeliveryStatus::is_terminal);
        if closing {
            self.reconciler.mark_closing(id);
        }

        let start = Instant::now();
        let result = self.compare_and_set(id, expected, patch).await;
        if closing && !matches!(result, Ok(AdvanceOutcome::Applied { .. })) {
            self.reconciler.unmark_closing(id);
        }
        self.metrics
            .operation_latency_seconds
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics
                    .transitions_total
                    .with_label_values(&["error"])
                    .inc();
                warn!(delivery_id = %id, expected = %expected, error = %err, "transition failed");
                return Err(err);
            }
        };
        self.metrics
            .transitions_total
            .with_label_values(&[outcome.label()])
            .inc();

        match &outcome {
            AdvanceOutcome::Applied { delivery } => {
                if next.is_some() {
                    info!(
                        delivery_id = %id,
                        from = %expected,
                        to = %delivery.status,
                        stage = delivery.stage().as_str(),
                        "delivery advanced"
                    );
                    self.publish(delivery, note).await;
                }
                if delivery.status.is_terminal() {
                    self.reconciler.reconcile(id);
                }
            }
            AdvanceOutcome::Stale { current } => {
                warn!(delivery_id = %id, expected = %expected, current = %current, "stale transition rejected");
            }
            AdvanceOutcome::Terminal { current } => {
                warn!(delivery_id = %id, current = %current, "delivery is no longer active");
                if !self.reconciler.is_settled_locally(id) {
                    let note = StatusNote::new(id, *current).with_note("delivery is no longer active");
                    if let PublishResult::Failed(reason) = self.sink.publish(note).await {
                        warn!(delivery_id = %id, reason = %reason, "status publish failed");
                    }
                    self.reconciler.reconcile(id);
                }
            }
        }

        Ok(outcome)
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        expected: DeliveryStatus,
        patch: DeliveryPatch,
    ) -> Result<AdvanceOutcome, AppError> {
        let current = self.store.read(id).await?.status;
        if current.is_terminal() {
            return Ok(AdvanceOutcome::Terminal { current });
        }
        if current != expected {
            return Ok(AdvanceOutcome::Stale { current });
        }

        match self.store.conditional_update(id, &[expected], patch).await? {
            UpdateOutcome::Applied(delivery) => Ok(AdvanceOutcome::Applied { delivery }),
            UpdateOutcome::Rejected { current } if current.is_terminal() => {
                Ok(AdvanceOutcome::Terminal { current })
            }
            UpdateOutcome::Rejected { current } => Ok(AdvanceOutcome::Stale { current }),
        }
    }

    async fn publish(&self, delivery: &Delivery, note: Option<String>) {
        let mut status_note = StatusNote::new(delivery.id, delivery.status);
        if let Some(note) = note {
            status_note = status_note.with_note(note);
        }

        if let PublishResult::Failed(reason) = self.sink.publish(status_note).await {
            warn!(delivery_id = %delivery.id, reason = %reason, "status publish failed");
        }
    }
}
