//! Client metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder (the CLI can install the Prometheus
//! exporter).

use metrics::counter;

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "tether_messages_total";
    pub const MESSAGES_BYTES: &str = "tether_messages_bytes";
    pub const DECODE_ERRORS_TOTAL: &str = "tether_decode_errors_total";
    pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
    pub const RECONNECTS_TOTAL: &str = "tether_reconnects_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "tether_heartbeat_timeouts_total";
    pub const PUSH_TIMEOUTS_TOTAL: &str = "tether_push_timeouts_total";
    pub const CHANNEL_JOINS_TOTAL: &str = "tether_channel_joins_total";
}

/// Describe every client metric to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames sent or received");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames sent or received");
    metrics::describe_counter!(names::DECODE_ERRORS_TOTAL, "Inbound frames that failed to decode");
    metrics::describe_counter!(names::CONNECTIONS_TOTAL, "Connections established");
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Reconnect attempts");
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS_TOTAL,
        "Heartbeats that went unanswered"
    );
    metrics::describe_counter!(names::PUSH_TIMEOUTS_TOTAL, "Pushes that timed out");
    metrics::describe_counter!(names::CHANNEL_JOINS_TOTAL, "Successful channel joins");
}

pub(crate) fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub(crate) fn record_decode_error() {
    counter!(names::DECODE_ERRORS_TOTAL).increment(1);
}

pub(crate) fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
}

pub(crate) fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

pub(crate) fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

pub(crate) fn record_push_timeout() {
    counter!(names::PUSH_TIMEOUTS_TOTAL).increment(1);
}

pub(crate) fn record_join() {
    counter!(names::CHANNEL_JOINS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // Just test that it doesn't panic
        describe_metrics();
        record_message(12, "inbound");
        record_push_timeout();
        record_join();
    }
}
