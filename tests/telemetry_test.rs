//! Integration tests for telemetry initialization and span helpers.

use workfeed::model::{DeliveryTag, Envelope, Task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = workfeed::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "workfeed-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = workfeed::telemetry::init_telemetry(config);
}

#[test]
fn refill_span_creates_and_records_count() {
    let span = workfeed::telemetry::feed::start_refill_span("idle", "crawler1:start_urls");
    workfeed::telemetry::feed::record_refill(&span, 1);
}

#[test]
fn task_span_creates() {
    let task = Task::from_envelope(
        "crawler1:start_urls",
        Envelope {
            delivery_tag: DeliveryTag::from(7_u64),
            properties: Default::default(),
            payload: b"http://a".to_vec(),
        },
    );
    let _span = workfeed::telemetry::feed::start_task_span(&task);
}
