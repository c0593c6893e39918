// src/core/metrics.rs

//! Defines and registers Prometheus metrics for agent monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Agent-wide Gauges ---
    /// The number of servers currently configured on this node.
    pub static ref SERVERS_CONFIGURED: Gauge =
        register_gauge!("helmsman_servers_configured", "Number of servers configured on this node.").unwrap();
    /// The number of websocket sessions currently open across all servers.
    pub static ref WEBSOCKET_SESSIONS: Gauge =
        register_gauge!("helmsman_websocket_sessions", "Number of currently open websocket sessions.").unwrap();
    /// The number of remote download jobs currently in flight.
    pub static ref DOWNLOADS_IN_FLIGHT: Gauge =
        register_gauge!("helmsman_downloads_in_flight", "Number of remote download jobs currently running.").unwrap();

    // --- Agent-wide Counters ---
    /// The total number of power actions processed, labeled by action name.
    pub static ref POWER_ACTIONS_TOTAL: CounterVec =
        register_counter_vec!("helmsman_power_actions_total", "Total number of power actions processed, labeled by action.", &["action"]).unwrap();
    /// The total number of events dropped due to a full subscriber sink, labeled by topic.
    pub static ref EVENTS_DROPPED_TOTAL: CounterVec =
        register_counter_vec!("helmsman_events_dropped_total", "Total number of bus events dropped for slow subscribers, labeled by topic.", &["topic"]).unwrap();
    /// The total number of console lines discarded by the output throttle.
    pub static ref THROTTLED_LINES_TOTAL: Counter =
        register_counter!("helmsman_throttled_lines_total", "Total number of console lines discarded by the output throttle.").unwrap();
    /// The total number of server crashes detected.
    pub static ref CRASHES_DETECTED_TOTAL: Counter =
        register_counter!("helmsman_crashes_detected_total", "Total number of container crashes detected.").unwrap();
    /// The total number of tokens rejected during validation.
    pub static ref TOKENS_REJECTED_TOTAL: Counter =
        register_counter!("helmsman_tokens_rejected_total", "Total number of signed tokens that failed validation.").unwrap();
}

/// Gathers all registered metrics and encodes them into the Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
