//! Server metrics definitions
//!
//! OpenTelemetry instruments for the relay's own activity: connections,
//! publishes, acknowledgements, and degraded-mode transitions. All metrics
//! are prefixed `relay.server.*`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use relay_server::ServerMetrics;
//!
//! let metrics = ServerMetrics::new("relay");
//! metrics.record_connection(5);
//! metrics.record_publish("deadbeef");
//! ```

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Server metrics for monitoring the relay broker.
pub struct ServerMetrics {
    /// Number of active WebSocket connections.
    pub connections_active: Gauge<i64>,
    /// Total connections accepted since startup.
    pub connections_total: Counter<u64>,
    /// Total JSON-RPC requests dispatched, by method.
    pub requests_total: Counter<u64>,
    /// Request dispatch latency in seconds.
    pub request_duration: Histogram<f64>,
    /// Current number of active subscriptions, by topic.
    pub subscribers_total: Gauge<i64>,
    /// Total messages published.
    pub publish_total: Counter<u64>,
    /// Total acknowledgements received.
    pub ack_total: Counter<u64>,
    /// Total retained messages currently held, sampled periodically.
    pub retained_total: Gauge<i64>,
    /// Total errors encountered, by kind.
    pub errors_total: Counter<u64>,
    /// Total transitions into or out of degraded (store-unavailable) mode.
    pub degraded_transitions_total: Counter<u64>,
}

impl ServerMetrics {
    /// Create a new `ServerMetrics` instance under the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    /// Create a new `ServerMetrics` instance with a caller-supplied meter.
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connections_active: meter
                .i64_gauge("relay.server.connections.active")
                .with_description("Number of active WebSocket connections")
                .build(),
            connections_total: meter
                .u64_counter("relay.server.connections.total")
                .with_description("Total number of connections established")
                .build(),
            requests_total: meter
                .u64_counter("relay.server.requests.total")
                .with_description("Total number of JSON-RPC requests dispatched")
                .build(),
            request_duration: meter
                .f64_histogram("relay.server.request.duration")
                .with_description("Request dispatch duration in seconds")
                .build(),
            subscribers_total: meter
                .i64_gauge("relay.server.subscribers.total")
                .with_description("Number of active subscriptions")
                .build(),
            publish_total: meter
                .u64_counter("relay.server.publish.total")
                .with_description("Total number of messages published")
                .build(),
            ack_total: meter
                .u64_counter("relay.server.ack.total")
                .with_description("Total number of acknowledgements received")
                .build(),
            retained_total: meter
                .i64_gauge("relay.server.retained.total")
                .with_description("Number of retained messages awaiting acknowledgement")
                .build(),
            errors_total: meter
                .u64_counter("relay.server.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
            degraded_transitions_total: meter
                .u64_counter("relay.server.degraded.transitions")
                .with_description("Total number of degraded-mode transitions")
                .build(),
        }
    }

    /// Record a new connection, given the resulting active count.
    pub fn record_connection(&self, active: i64) {
        self.connections_active.record(active, &[]);
        self.connections_total.add(1, &[]);
    }

    /// Record a disconnection, given the resulting active count.
    pub fn record_disconnection(&self, active: i64) {
        self.connections_active.record(active, &[]);
    }

    /// Record a dispatched request.
    pub fn record_request(&self, method: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    /// Update the subscriber count for a topic.
    pub fn update_subscribers(&self, topic: &str, count: i64) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.subscribers_total.record(count, attributes);
    }

    /// Record a published message.
    pub fn record_publish(&self, topic: &str) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.publish_total.add(1, attributes);
    }

    /// Record an acknowledgement.
    pub fn record_ack(&self, topic: &str) {
        let attributes = &[KeyValue::new("topic", topic.to_string())];
        self.ack_total.add(1, attributes);
    }

    /// Update the number of retained messages awaiting acknowledgement.
    pub fn update_retained(&self, count: i64) {
        self.retained_total.record(count, &[]);
    }

    /// Record an error by coarse kind (e.g. `"transient_store"`, `"fatal_store"`).
    pub fn record_error(&self, error_type: &str) {
        let attributes = &[KeyValue::new("error_type", error_type.to_string())];
        self.errors_total.add(1, attributes);
    }

    /// Record a transition into or out of degraded mode.
    pub fn record_degraded_transition(&self, degraded: bool) {
        let attributes = &[KeyValue::new("degraded", degraded)];
        self.degraded_transitions_total.add(1, attributes);
    }
}
