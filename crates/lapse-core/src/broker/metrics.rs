use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// How a message reached its topic's delivery list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSource {
    /// Produced without a delay.
    Immediate,
    /// Timer expiration seen by a listener.
    Expired,
    /// Lapsed timer found by the startup scan.
    Recovered,
}

impl DispatchSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchSource::Immediate => "immediate",
            DispatchSource::Expired => "expired",
            DispatchSource::Recovered => "recovered",
        }
    }
}

/// Core OTel metrics for the queue. If no meter provider is configured the
/// instruments are no-op.
pub struct Metrics {
    pub messages_produced: Counter<u64>,
    pub messages_delayed: Counter<u64>,
    pub messages_dispatched: Counter<u64>,
    pub recovery_skipped: Counter<u64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("lapse");
        Self::from_meter(&meter)
    }

    /// Create metrics from a specific meter (used in tests with in-memory exporter).
    pub fn from_meter(meter: &Meter) -> Self {
        Self {
            messages_produced: meter
                .u64_counter("lapse.messages.produced")
                .with_description("Total messages produced")
                .build(),
            messages_delayed: meter
                .u64_counter("lapse.messages.delayed")
                .with_description("Messages registered with a delay timer")
                .build(),
            messages_dispatched: meter
                .u64_counter("lapse.messages.dispatched")
                .with_description("Messages pushed onto a topic delivery list")
                .build(),
            recovery_skipped: meter
                .u64_counter("lapse.recovery.skipped")
                .with_description("Payload keys the recovery scan could not use")
                .build(),
        }
    }

    pub fn record_produce(&self, topic: &str) {
        self.messages_produced
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_delay(&self, topic: &str) {
        self.messages_delayed
            .add(1, &[KeyValue::new("topic", topic.to_string())]);
    }

    pub fn record_dispatch(&self, topic: &str, source: DispatchSource) {
        self.messages_dispatched.add(
            1,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("source", source.as_str()),
            ],
        );
    }

    pub fn record_recovery_skip(&self, node: &str) {
        self.recovery_skipped
            .add(1, &[KeyValue::new("node", node.to_string())]);
    }
}
