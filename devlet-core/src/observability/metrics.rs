//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - gauges for current counts

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    describe_counter!(
        "devlet_plugin_starts_total",
        "Total number of device plugin starts (by resource)"
    );
    describe_counter!(
        "devlet_plugin_start_failures_total",
        "Total number of device plugin start failures (by resource)"
    );
    describe_gauge!("devlet_plugins_running", "Current number of running device plugins");

    describe_counter!(
        "devlet_health_transitions_total",
        "Total number of device health transitions (by resource, state)"
    );

    describe_counter!(
        "devlet_allocations_total",
        "Total number of Allocate calls (by resource, status)"
    );

    describe_gauge!(
        "devlet_device_plugins_ready",
        "1 when every desired device plugin is initialized, else 0"
    );

    describe_counter!(
        "devlet_mdevs_created_total",
        "Total number of mediated devices created (by type)"
    );
    describe_counter!(
        "devlet_mdevs_removed_total",
        "Total number of mediated devices removed (by type)"
    );
}

pub fn record_plugin_started(resource: &str) {
    counter!("devlet_plugin_starts_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_plugin_start_failure(resource: &str) {
    counter!("devlet_plugin_start_failures_total", "resource" => resource.to_string()).increment(1);
}

pub fn set_plugins_running(count: usize) {
    gauge!("devlet_plugins_running").set(count as f64);
}

pub fn set_ready(ready: bool) {
    gauge!("devlet_device_plugins_ready").set(if ready { 1.0 } else { 0.0 });
}

pub fn record_health_transition(resource: &str, healthy: bool) {
    let state = if healthy { "healthy" } else { "unhealthy" };
    counter!("devlet_health_transitions_total", "resource" => resource.to_string(), "state" => state)
        .increment(1);
}

pub fn record_allocation(resource: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!("devlet_allocations_total", "resource" => resource.to_string(), "status" => status)
        .increment(1);
}

pub fn record_mdev_created(type_id: &str) {
    counter!("devlet_mdevs_created_total", "type" => type_id.to_string()).increment(1);
}

pub fn record_mdev_removed(type_id: &str) {
    counter!("devlet_mdevs_removed_total", "type" => type_id.to_string()).increment(1);
}
