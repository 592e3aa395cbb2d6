//! End-to-end pipeline tests: source → transform → sink.

use sluice::filters::{Capture, CaptureSink, CounterSource, PassThrough};
use sluice::props::PropValue;
use sluice::registry::FilterRegistry;
use sluice::session::{ReportKind, Session};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_packets_flow_through_passthrough_to_sink() {
    init_tracing();
    let registry = Arc::new(FilterRegistry::new());
    registry.register(PassThrough::descriptor()).unwrap();
    let capture = Capture::new();
    registry
        .register(CaptureSink::descriptor(Arc::clone(&capture)))
        .unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter(
            "counter-src",
            &[("count", PropValue::Uint(20)), ("size", PropValue::Uint(8))],
        )
        .unwrap();
    session.run().unwrap();

    // Every packet arrived, in order, payload intact.
    let payloads = capture.payloads();
    assert_eq!(payloads.len(), 20);
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(payload.len(), 8);
        assert!(payload.iter().all(|&b| b == i as u8));
    }
    assert!(capture.finished());

    // The transform actually sat between source and sink.
    let names: Vec<String> = session
        .instance_reports()
        .into_iter()
        .map(|r| r.instance)
        .collect();
    assert!(names.iter().any(|n| n.starts_with("passthrough#")));

    // Reference-count conservation: every payload released.
    assert_eq!(session.accounting().outstanding(), 0);
}

#[test]
fn test_fifo_order_preserved_per_edge() {
    init_tracing();
    let registry = Arc::new(FilterRegistry::new());
    let capture = Capture::new();
    registry
        .register(CaptureSink::descriptor(Arc::clone(&capture)))
        .unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter(
            "counter-src",
            &[("count", PropValue::Uint(200)), ("size", PropValue::Uint(1))],
        )
        .unwrap();
    session.run().unwrap();

    let payloads = capture.payloads();
    assert_eq!(payloads.len(), 200);
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(payload[0], (i % 256) as u8, "packet {i} out of order");
    }
    // Timestamps are monotonically increasing along the edge.
    let timestamps = capture.timestamps();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_unmatched_output_is_reported_not_fatal() {
    init_tracing();
    // Nothing registered that could consume the source's output.
    let registry = Arc::new(FilterRegistry::new());
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter("counter-src", &[("count", PropValue::Uint(5))])
        .unwrap();
    // The graph still runs to completion.
    session.run().unwrap();

    let reports = session.reports();
    assert!(reports.iter().any(|r| r.kind == ReportKind::NoConsumer));
    // Packets sent into the void were released, not leaked.
    assert_eq!(session.accounting().outstanding(), 0);
}

#[test]
fn test_empty_session_completes_immediately() {
    init_tracing();
    // No filters at all: nothing to drain, run returns right away
    // instead of waiting for instances that will never exist.
    let session = Session::new(Arc::new(FilterRegistry::new()));
    let started = std::time::Instant::now();
    session.run().unwrap();
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}

#[test]
fn test_instance_reports_expose_stats() {
    init_tracing();
    let registry = Arc::new(FilterRegistry::new());
    let capture = Capture::new();
    registry
        .register(CaptureSink::descriptor(Arc::clone(&capture)))
        .unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter("counter-src", &[("count", PropValue::Uint(10))])
        .unwrap();
    session.run().unwrap();

    let reports = session.instance_reports();
    let src = reports
        .iter()
        .find(|r| r.instance.starts_with("counter-src#"))
        .unwrap();
    assert_eq!(src.packets_sent, 10);
    assert_eq!(src.packets_dropped, 0);
    assert!(src.process_calls >= 1);
}
