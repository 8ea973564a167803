use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub claims_total: IntCounterVec,
    pub transitions_total: IntCounterVec,
    pub stop_updates_total: IntCounterVec,
    pub offers_active: IntGauge,
    pub operation_latency_seconds: HistogramVec,
    pub channel_teardowns_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let claims_total = IntCounterVec::new(
            Opts::new("claims_total", "Offer claims by outcome"),
            &["outcome"],
        )
        .expect("valid claims_total metric");

        let transitions_total = IntCounterVec::new(
            Opts::new("transitions_total", "Delivery status transitions by outcome"),
            &["outcome"],
        )
        .expect("valid transitions_total metric");

        let stop_updates_total = IntCounterVec::new(
            Opts::new("stop_updates_total", "Stop status updates by outcome"),
            &["outcome"],
        )
        .expect("valid stop_updates_total metric");

        let offers_active = IntGauge::new("offers_active", "Offers awaiting a decision")
            .expect("valid offers_active metric");

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Latency of engine operations against the record store in seconds",
            ),
            &["operation"],
        )
        .expect("valid operation_latency_seconds metric");

        let channel_teardowns_total = IntCounterVec::new(
            Opts::new("channel_teardowns_total", "Per-job channel teardowns by result"),
            &["result"],
        )
        .expect("valid channel_teardowns_total metric");

        registry
            .register(Box::new(claims_total.clone()))
            .expect("register claims_total");
        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register transitions_total");
        registry
            .register(Box::new(stop_updates_total.clone()))
            .expect("register stop_updates_total");
        registry
            .register(Box::new(offers_active.clone()))
            .expect("register offers_active");
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .expect("register operation_latency_seconds");
        registry
            .register(Box::new(channel_teardowns_total.clone()))
            .expect("register channel_teardowns_total");

        Self {
            registry,
            claims_total,
            transitions_total,
            stop_updates_total,
            offers_active,
            operation_latency_seconds,
            channel_teardowns_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
