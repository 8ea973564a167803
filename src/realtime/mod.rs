pub mod tracking;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::delivery::DeliveryStatus;
use crate::models::event::RealtimeEvent;

#[derive(Debug, Clone)]
pub struct StatusNote {
    pub delivery_id: Uuid,
    pub status: DeliveryStatus,
    pub note: Option<String>,
}

impl StatusNote {
    pub fn new(delivery_id: Uuid, status: DeliveryStatus) -> Self {
        Self {
            delivery_id,
            status,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum PublishResult {
    Ack,
    Failed(String),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, note: StatusNote) -> PublishResult;
}

#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<RealtimeEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, note: StatusNote) -> PublishResult {
        let event = RealtimeEvent::Status {
            delivery_id: note.delivery_id,
            status: note.status,
            stage: note.status.stage(),
            note: note.note,
            at: Utc::now(),
        };

        // Nobody listening is not a failure.
        if self.tx.send(event).is_err() {
            debug!(delivery_id = %note.delivery_id, "status event had no subscribers");
        }
        PublishResult::Ack
    }
}
