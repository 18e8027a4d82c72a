//! Metric names exported by the proxy.

use pkg_metrics::{DEFAULT_LATENCY_BUCKETS, MetricsRegistry};

pub const SYNC_PROXY_RULES_TOTAL: &str = "k3rs_proxy_sync_proxy_rules_total";
pub const SYNC_PROXY_RULES_DURATION: &str = "k3rs_proxy_sync_proxy_rules_duration_seconds";
pub const SYNC_PROXY_RULES_LAST_TIMESTAMP: &str =
    "k3rs_proxy_sync_proxy_rules_last_timestamp_seconds";
pub const IPTABLES_RESTORE_FAILURES_TOTAL: &str = "k3rs_proxy_iptables_restore_failures_total";
pub const SERVICE_CHANGES_TOTAL: &str = "k3rs_proxy_service_changes_total";
pub const SERVICE_CHANGES_PENDING: &str = "k3rs_proxy_service_changes_pending";
pub const ENDPOINT_CHANGES_TOTAL: &str = "k3rs_proxy_endpoint_changes_total";
pub const ENDPOINT_CHANGES_PENDING: &str = "k3rs_proxy_endpoint_changes_pending";
pub const NETWORK_PROGRAMMING_DURATION: &str = "k3rs_proxy_network_programming_duration_seconds";
pub const GRACEFUL_TERMINATION_PENDING: &str = "k3rs_proxy_graceful_termination_pending";

/// Network programming latency reaches minutes when the proxy is behind.
const PROGRAMMING_BUCKETS: &[f64] = &[
    0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

pub fn register_metrics(registry: &MetricsRegistry) {
    registry.register_counter(SYNC_PROXY_RULES_TOTAL, "Number of completed sync passes");
    registry.register_histogram(
        SYNC_PROXY_RULES_DURATION,
        "Duration of a sync pass in seconds",
        DEFAULT_LATENCY_BUCKETS,
    );
    registry.register_gauge(
        SYNC_PROXY_RULES_LAST_TIMESTAMP,
        "Unix time of the last successful sync pass",
    );
    registry.register_counter(
        IPTABLES_RESTORE_FAILURES_TOTAL,
        "Number of failed iptables restores",
    );
    registry.register_counter(SERVICE_CHANGES_TOTAL, "Number of service changes received");
    registry.register_gauge(SERVICE_CHANGES_PENDING, "Service changes not yet synced");
    registry.register_counter(ENDPOINT_CHANGES_TOTAL, "Number of endpoint changes received");
    registry.register_gauge(ENDPOINT_CHANGES_PENDING, "Endpoint changes not yet synced");
    registry.register_histogram(
        NETWORK_PROGRAMMING_DURATION,
        "Time from an endpoint change to its programming in the dataplane",
        PROGRAMMING_BUCKETS,
    );
    registry.register_gauge(
        GRACEFUL_TERMINATION_PENDING,
        "Real servers draining before deletion",
    );
}
