//! Metrics collection and exposition.
//!
//! # Metrics
//! - `remoting_channels_opened_total` (counter): channels admitted by a service
//! - `remoting_channels_rejected_total` (counter): opens refused while stopping
//! - `remoting_channels_active` (gauge): live channels across services
//! - `remoting_auth_failures_total` (counter): failed handshakes by mechanism
//! - `remoting_handles_forced_total` (counter): handles force-closed
//! - `remoting_drain_timeouts_total` (counter): handles that missed the drain deadline
//! - `remoting_echo_messages_total` (counter): echo replies

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
///
/// Must run inside a tokio runtime. Failures are logged, not fatal.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe_metrics();
            tracing::info!(address = %addr, "Prometheus exporter listening");
        }
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

fn describe_metrics() {
    describe_counter!("remoting_channels_opened_total", "Channels admitted by a service");
    describe_counter!("remoting_channels_rejected_total", "Channel opens refused while a service was stopping");
    describe_gauge!("remoting_channels_active", "Live channels across all services");
    describe_counter!("remoting_auth_failures_total", "Failed authentication handshakes");
    describe_counter!("remoting_handles_forced_total", "Channel handles force-closed");
    describe_counter!("remoting_drain_timeouts_total", "Channel handles that missed the drain deadline");
    describe_counter!("remoting_echo_messages_total", "Messages echoed by the echo service");
}
