use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central metrics registry for the gateway's own request-serving data plane.
pub struct MetricsRegistry {
    registry: Registry,

    // HTTP metrics
    pub http_requests_total: CounterVec,
    pub http_request_duration_seconds: HistogramVec,

    // RPC racer metrics
    pub rpc_requests_total: CounterVec,
    pub rpc_request_duration_seconds: HistogramVec,
    pub rpc_endpoint_health_score: GaugeVec,
    pub rpc_circuit_breaker_state: GaugeVec,

    // Cache metrics
    pub cache_operations_total: CounterVec,
    pub cache_entries_total: GaugeVec,

    // Admission metrics
    pub admission_rejections_total: CounterVec,
    pub admission_inflight: GaugeVec,

    // Bus metrics
    pub bus_events_published_total: CounterVec,
    pub bus_subscriber_drops_total: CounterVec,
    pub bus_active_subscribers: GaugeVec,

    // Latency controller metrics
    pub latency_p99_ms: GaugeVec,
    pub latency_adaptations_total: CounterVec,

    pub build_info: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("gateway_http_requests_total", "Total HTTP requests").namespace("gateway"),
            &["method", "endpoint", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_http_request_duration_seconds", "HTTP request duration")
                .namespace("gateway")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["method", "endpoint"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        let rpc_requests_total = CounterVec::new(
            Opts::new("gateway_rpc_requests_total", "Total upstream RPC attempts").namespace("gateway"),
            &["chain", "method", "status"],
        )?;
        registry.register(Box::new(rpc_requests_total.clone()))?;

        let rpc_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("gateway_rpc_request_duration_seconds", "Upstream RPC call duration")
                .namespace("gateway")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["chain", "method"],
        )?;
        registry.register(Box::new(rpc_request_duration_seconds.clone()))?;

        let rpc_endpoint_health_score = GaugeVec::new(
            Opts::new("gateway_rpc_endpoint_health_score", "Per-endpoint success rate (0.0-1.0)")
                .namespace("gateway"),
            &["chain", "endpoint"],
        )?;
        registry.register(Box::new(rpc_endpoint_health_score.clone()))?;

        let rpc_circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "gateway_rpc_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            )
            .namespace("gateway"),
            &["tier", "chain"],
        )?;
        registry.register(Box::new(rpc_circuit_breaker_state.clone()))?;

        let cache_operations_total = CounterVec::new(
            Opts::new("gateway_cache_operations_total", "Total cache operations").namespace("gateway"),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cache_operations_total.clone()))?;

        let cache_entries_total = GaugeVec::new(
            Opts::new("gateway_cache_entries_total", "Current cache entry count").namespace("gateway"),
            &["cache"],
        )?;
        registry.register(Box::new(cache_entries_total.clone()))?;

        let admission_rejections_total = CounterVec::new(
            Opts::new("gateway_admission_rejections_total", "Admission rejections").namespace("gateway"),
            &["tier", "reason"],
        )?;
        registry.register(Box::new(admission_rejections_total.clone()))?;

        let admission_inflight = GaugeVec::new(
            Opts::new("gateway_admission_inflight", "In-flight requests per tier").namespace("gateway"),
            &["tier"],
        )?;
        registry.register(Box::new(admission_inflight.clone()))?;

        let bus_events_published_total = CounterVec::new(
            Opts::new("gateway_bus_events_published_total", "Block events published").namespace("gateway"),
            &["chain"],
        )?;
        registry.register(Box::new(bus_events_published_total.clone()))?;

        let bus_subscriber_drops_total = CounterVec::new(
            Opts::new("gateway_bus_subscriber_drops_total", "Dropped events due to backpressure")
                .namespace("gateway"),
            &["chain"],
        )?;
        registry.register(Box::new(bus_subscriber_drops_total.clone()))?;

        let bus_active_subscribers = GaugeVec::new(
            Opts::new("gateway_bus_active_subscribers", "Live subscribers per chain").namespace("gateway"),
            &["chain"],
        )?;
        registry.register(Box::new(bus_active_subscribers.clone()))?;

        let latency_p99_ms = GaugeVec::new(
            Opts::new("gateway_latency_p99_ms", "Rolling P99 latency per chain").namespace("gateway"),
            &["chain"],
        )?;
        registry.register(Box::new(latency_p99_ms.clone()))?;

        let latency_adaptations_total = CounterVec::new(
            Opts::new("gateway_latency_adaptations_total", "Adaptive deadline shrink events").namespace("gateway"),
            &["chain"],
        )?;
        registry.register(Box::new(latency_adaptations_total.clone()))?;

        let build_info = Gauge::new("gateway_build_info", "Always 1, labels carry version via help text")?;
        registry.register(Box::new(build_info.clone()))?;
        build_info.set(1.0);

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            rpc_requests_total,
            rpc_request_duration_seconds,
            rpc_endpoint_health_score,
            rpc_circuit_breaker_state,
            cache_operations_total,
            cache_entries_total,
            admission_rejections_total,
            admission_inflight,
            bus_events_published_total,
            bus_subscriber_drops_total,
            bus_active_subscribers,
            latency_p99_ms,
            latency_adaptations_total,
            build_info,
        }))
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_without_duplicate_metric_names() {
        let registry = MetricsRegistry::new().expect("registry should construct");
        registry.http_requests_total.with_label_values(&["GET", "/health", "200"]).inc();
        let exported = registry.export().expect("export should succeed");
        assert!(exported.contains("gateway_http_requests_total"));
    }
}
