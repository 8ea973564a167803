use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::engine::commission::{CommissionResolver, StaticCommissionResolver};
use crate::engine::offer::OfferArbiter;
use crate::engine::progression::ProgressionEngine;
use crate::engine::reconcile::{ChannelRegistry, Reconciler};
use crate::engine::session::SessionRegistry;
use crate::engine::watch::JobChannels;
use crate::models::event::RealtimeEvent;
use crate::observability::metrics::Metrics;
use crate::realtime::tracking::LocationTracker;
use crate::realtime::{BroadcastSink, NotificationSink};
use crate::store::memory::InMemoryStore;
use crate::store::RecordStore;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn RecordStore>,
    pub sessions: Arc<SessionRegistry>,
    pub channels: Arc<ChannelRegistry>,
    pub tracker: Arc<LocationTracker>,
    pub arbiter: OfferArbiter,
    pub progression: ProgressionEngine,
    pub events_tx: broadcast::Sender<RealtimeEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let resolver = Arc::new(StaticCommissionResolver::new(config.default_commission_rate));
        Self::with_collaborators(config, Arc::new(InMemoryStore::new()), resolver)
    }

    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn RecordStore>,
        resolver: Arc<dyn CommissionResolver>,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let metrics = Metrics::new();
        let sink: Arc<dyn NotificationSink> = Arc::new(BroadcastSink::new(events_tx.clone()));

        let sessions = Arc::new(SessionRegistry::new(resolver, config.commission_poll_interval()));
        let channels = Arc::new(ChannelRegistry::new());
        let tracker = Arc::new(LocationTracker::new(events_tx.clone()));
        let reconciler = Reconciler::new(channels.clone(), sessions.clone(), metrics.clone());

        let progression =
            ProgressionEngine::new(store.clone(), sink.clone(), reconciler.clone(), metrics.clone());
        let job_channels = JobChannels::new(store.clone(), sink.clone(), tracker.clone(), reconciler);
        let arbiter = OfferArbiter::new(
            store.clone(),
            sink,
            sessions.clone(),
            job_channels,
            metrics.clone(),
        );

        Self {
            config,
            store,
            sessions,
            channels,
            tracker,
            arbiter,
            progression,
            events_tx,
            metrics,
        }
    }
}
