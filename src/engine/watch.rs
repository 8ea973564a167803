use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::reconcile::{ChannelKind, Reconciler, WatchTask};
use crate::error::AppError;
use crate::models::delivery::Delivery;
use crate::realtime::tracking::LocationTracker;
use crate::realtime::{NotificationSink, PublishResult, StatusNote};
use crate::store::{RecordStore, SnapshotStream};

#[derive(Clone)]
pub struct JobChannels {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    tracker: Arc<LocationTracker>,
    reconciler: Reconciler,
}

impl JobChannels {
    pub fn new(
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn NotificationSink>,
        tracker: Arc<LocationTracker>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            store,
            sink,
            tracker,
            reconciler,
        }
    }

    pub async fn open(&self, delivery: &Delivery) -> Result<(), AppError> {
        let driver_id = delivery.driver_id.ok_or_else(|| {
            AppError::Invariant(format!("delivery {} has no driver to track", delivery.id))
        })?;
        let channels = self.reconciler.channels();

        let tracking = self.tracker.open(delivery.id, driver_id);
        channels.register(delivery.id, ChannelKind::LocationTracking, tracking);

        let snapshots = self.store.subscribe(delivery.id).await?;
        let task = tokio::spawn(watch_delivery(
            delivery.id,
            snapshots,
            self.store.clone(),
            self.sink.clone(),
            self.reconciler.clone(),
        ));
        channels.register(
            delivery.id,
            ChannelKind::StatusWatch,
            Arc::new(WatchTask(task.abort_handle())),
        );

        // A cancellation may have landed before the subscription existed.
        let current = self.store.read(delivery.id).await?;
        if current.status.is_terminal() {
            self.reconciler.reconcile(delivery.id);
        }
        Ok(())
    }
}

async fn watch_delivery(
    delivery_id: Uuid,
    mut snapshots: SnapshotStream,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn NotificationSink>,
    reconciler: Reconciler,
) {
    while let Some(snapshot) = snapshots.next().await {
        if !snapshot.status.is_terminal() {
            continue;
        }

        // Snapshots can be stale or out of order; only the store decides.
        let current = match store.read(delivery_id).await {
            Ok(current) => current,
            Err(err) => {
                warn!(delivery_id = %delivery_id, error = %err, "failed to confirm terminal snapshot");
                continue;
            }
        };
        if !current.status.is_terminal() {
            debug!(delivery_id = %delivery_id, status = %current.status, "terminal snapshot superseded");
            continue;
        }
        if reconciler.is_settled_locally(delivery_id) {
            // The engine that wrote this status reconciles the job itself.
            continue;
        }

        info!(delivery_id = %delivery_id, status = %current.status, "delivery ended outside this session");
        let note = StatusNote::new(delivery_id, current.status).with_note("delivery is no longer active");
        if let PublishResult::Failed(reason) = sink.publish(note).await {
            warn!(delivery_id = %delivery_id, reason = %reason, "status publish failed");
        }
        reconciler.reconcile(delivery_id);
        break;
    }
}
