//! Prometheus counters and histograms shared across the listeners.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,
    /// DHCP packets by outcome: replied, ignored, parse_error, not_found,
    /// error, dropped.
    pub dhcp_packets: IntCounterVec,
    /// HTTP requests by handler and status class.
    pub http_requests: IntCounterVec,
    /// TFTP transfers by outcome: completed, not_found, denied, error.
    pub tftp_transfers: IntCounterVec,
    /// Bytes streamed through the ISO patcher.
    pub iso_bytes: IntCounter,
    /// ISO requests that found and patched the magic region.
    pub iso_patched: IntCounter,
    /// Syslog datagrams dropped because the parse queue was full.
    pub syslog_dropped: IntCounter,
    /// DHCP handling time, by mode.
    pub dhcp_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dhcp_packets = register_int_counter_vec_with_registry!(
            "dhcp_packets_total",
            "DHCP packets by handling outcome",
            &["outcome"],
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let http_requests = register_int_counter_vec_with_registry!(
            "http_requests_total",
            "HTTP requests by handler and status",
            &["handler", "status"],
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let tftp_transfers = register_int_counter_vec_with_registry!(
            "tftp_transfers_total",
            "TFTP transfers by outcome",
            &["outcome"],
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let iso_bytes = register_int_counter_with_registry!(
            "iso_proxy_bytes_total",
            "Bytes streamed through the ISO patcher",
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let iso_patched = register_int_counter_with_registry!(
            "iso_patches_total",
            "ISO streams whose magic region was patched",
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let syslog_dropped = register_int_counter_with_registry!(
            "syslog_dropped_total",
            "Syslog datagrams dropped because the parser queue was full",
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");
        let dhcp_duration = register_histogram_vec_with_registry!(
            "dhcp_handle_seconds",
            "Time spent handling one DHCP packet",
            &["mode"],
            registry
        )
        .expect("metric registration cannot fail with a fresh registry");

        Self {
            registry,
            dhcp_packets,
            http_requests,
            tftp_transfers,
            iso_bytes,
            iso_patched,
            syslog_dropped,
            dhcp_duration,
        }
    }

    /// Text exposition of every registered metric.
    pub fn gather(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {e}");
        }
        String::from_utf8_lossy(&buf).to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
