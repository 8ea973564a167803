use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::session::SessionRegistry;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    StatusWatch,
    LocationTracking,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::StatusWatch => "status_watch",
            ChannelKind::LocationTracking => "location_tracking",
        }
    }
}

pub trait Teardown: Send + Sync {
    fn teardown(&self) -> Result<(), String>;
}

pub struct WatchTask(pub AbortHandle);

impl Teardown for WatchTask {
    fn teardown(&self) -> Result<(), String> {
        self.0.abort();
        Ok(())
    }
}

struct OpenChannel {
    kind: ChannelKind,
    handle: Arc<dyn Teardown>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<Uuid, Vec<OpenChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, delivery_id: Uuid, kind: ChannelKind, handle: Arc<dyn Teardown>) {
        self.channels
            .entry(delivery_id)
            .or_default()
            .push(OpenChannel { kind, handle });
    }

    pub fn open_channels(&self, delivery_id: Uuid) -> Vec<ChannelKind> {
        self.channels
            .get(&delivery_id)
            .map(|open| open.iter().map(|channel| channel.kind).collect())
            .unwrap_or_default()
    }

    pub fn job_count(&self) -> usize {
        self.channels.len()
    }

    fn take(&self, delivery_id: Uuid) -> Vec<OpenChannel> {
        self.channels
            .remove(&delivery_id)
            .map(|(_, open)| open)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub released: usize,
    pub failures: Vec<String>,
}

// Teardown problems are logged and counted; they never fail the caller.
#[derive(Clone)]
pub struct Reconciler {
    channels: Arc<ChannelRegistry>,
    sessions: Arc<SessionRegistry>,
    // jobs this process is moving to a terminal status itself
    closing: Arc<DashSet<Uuid>>,
    metrics: Metrics,
}

impl Reconciler {
    pub fn new(channels: Arc<ChannelRegistry>, sessions: Arc<SessionRegistry>, metrics: Metrics) -> Self {
        Self {
            channels,
            sessions,
            closing: Arc::new(DashSet::new()),
            metrics,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn mark_closing(&self, delivery_id: Uuid) {
        self.closing.insert(delivery_id);
    }

    pub fn unmark_closing(&self, delivery_id: Uuid) {
        self.closing.remove(&delivery_id);
    }

    pub fn is_settled_locally(&self, delivery_id: Uuid) -> bool {
        self.closing.contains(&delivery_id) || self.channels.open_channels(delivery_id).is_empty()
    }

    pub fn reconcile(&self, delivery_id: Uuid) -> TeardownReport {
        let mut report = TeardownReport::default();

        for channel in self.channels.take(delivery_id) {
            match channel.handle.teardown() {
                Ok(()) => {
                    report.released += 1;
                    self.metrics
                        .channel_teardowns_total
                        .with_label_values(&["released"])
                        .inc();
                }
                Err(reason) => {
                    warn!(
                        delivery_id = %delivery_id,
                        channel = channel.kind.as_str(),
                        reason = %reason,
                        "failed to tear down channel"
                    );
                    self.metrics
                        .channel_teardowns_total
                        .with_label_values(&["failed"])
                        .inc();
                    report
                        .failures
                        .push(format!("{}: {reason}", channel.kind.as_str()));
                }
            }
        }

        self.sessions.release_delivery(delivery_id);
        self.closing.remove(&delivery_id);

        if report.released > 0 || !report.failures.is_empty() {
            info!(
                delivery_id = %delivery_id,
                released = report.released,
                failed = report.failures.len(),
                "job resources reconciled"
            );
        }
        report
    }
}
