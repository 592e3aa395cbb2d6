//! Capability matching through a live session: determinism and
//! exclusion semantics.

use sluice::error::Result;
use sluice::filter::{ConfigureOutcome, Filter, FilterCtx, LifecycleState, ProcessStatus};
use sluice::filters::{Capture, CaptureSink, CounterSource};
use sluice::port::InputPort;
use sluice::props::{PropKey, PropValue};
use sluice::registry::{CapBundle, CapPredicate, FilterDescriptor, FilterRegistry};
use sluice::session::{ReportKind, Session};
use std::sync::Arc;

/// An excluded format must never be linked to the excluding filter,
/// even when every other predicate matches.
#[test]
fn test_excluded_format_never_matched() {
    let registry = Arc::new(FilterRegistry::new());
    // Greedy sink that takes anything with a codec id, except the
    // "secret" format.
    let greedy = Capture::new();
    registry
        .register(CaptureSink::descriptor_matching(
            Arc::clone(&greedy),
            CapBundle::new()
                .with(CapPredicate::require_present(PropKey::CodecId))
                .with(CapPredicate::exclude(PropKey::CodecId, "secret")),
        ))
        .unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter(
            "counter-src",
            &[
                ("count", PropValue::Uint(5)),
                ("codec", PropValue::Str("secret".into())),
            ],
        )
        .unwrap();
    session.run().unwrap();

    // The excluding sink was never instantiated and saw nothing.
    assert_eq!(greedy.count(), 0);
    let names: Vec<String> = session
        .instance_reports()
        .into_iter()
        .map(|r| r.instance)
        .collect();
    assert!(!names.iter().any(|n| n.starts_with("capture-sink#")));
}

#[test]
fn test_non_excluded_format_matches_same_bundle() {
    let registry = Arc::new(FilterRegistry::new());
    let greedy = Capture::new();
    registry
        .register(CaptureSink::descriptor_matching(
            Arc::clone(&greedy),
            CapBundle::new()
                .with(CapPredicate::require_present(PropKey::CodecId))
                .with(CapPredicate::exclude(PropKey::CodecId, "secret")),
        ))
        .unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter("counter-src", &[("count", PropValue::Uint(5))])
        .unwrap();
    session.run().unwrap();
    assert_eq!(greedy.count(), 5);
}

/// A consumer whose `configure_port` never accepts the port.
struct NeverAccepts;

fn never_accepts() -> Arc<FilterDescriptor> {
    FilterDescriptor::builder("never-accepts")
        .input_bundle(CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId)))
        .factory(|_| Ok(Box::new(NeverAccepts)))
        .build_shared()
}

impl Filter for NeverAccepts {
    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::NewInstanceRequired)
    }

    fn process(&mut self, _ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        ProcessStatus::Ok
    }
}

/// Rejection is a first-class outcome: an instance that declines every
/// port must be reclaimed, not left parked in `Configuring` where it
/// would hold the session open forever.
#[test]
fn test_rejecting_consumer_is_reclaimed_and_session_completes() {
    let registry = Arc::new(FilterRegistry::new());
    registry.register(never_accepts()).unwrap();
    registry.register(CounterSource::descriptor()).unwrap();

    let session = Session::new(registry);
    session
        .add_filter("counter-src", &[("count", PropValue::Uint(4))])
        .unwrap();
    session.run().unwrap();

    let instances = session.instance_reports();
    assert!(instances
        .iter()
        .filter(|r| r.instance.starts_with("never-accepts#"))
        .all(|r| r.state == LifecycleState::Destroyed));
    // The output stayed unconnected: reported, and its packets were
    // dropped rather than queued.
    assert!(session
        .reports()
        .iter()
        .any(|r| r.kind == ReportKind::NoConsumer));
    let src = instances
        .iter()
        .find(|r| r.instance.starts_with("counter-src#"))
        .expect("source instance report");
    assert_eq!(src.packets_dropped, 4);
}

/// Identical registries and snapshots resolve to the identical graph
/// every run.
#[test]
fn test_linking_is_deterministic_across_runs() {
    let mut shapes = Vec::new();
    for _ in 0..5 {
        let registry = Arc::new(FilterRegistry::new());
        let wins = Capture::new();
        // Same bundle, same priority: registration order decides.
        registry
            .register(CaptureSink::descriptor_matching(
                Arc::clone(&wins),
                CapBundle::new().with(CapPredicate::require_present(PropKey::CodecId)),
            ))
            .unwrap();
        registry
            .register(
                sluice::registry::FilterDescriptor::builder("late-sink")
                    .priority(10)
                    .input_bundle(
                        CapBundle::new()
                            .with(CapPredicate::require_present(PropKey::CodecId)),
                    )
                    .build_shared(),
            )
            .unwrap();
        registry.register(CounterSource::descriptor()).unwrap();

        let session = Session::new(registry);
        session
            .add_filter("counter-src", &[("count", PropValue::Uint(3))])
            .unwrap();
        session.run().unwrap();

        assert_eq!(wins.count(), 3);
        let mut names: Vec<String> = session
            .instance_reports()
            .into_iter()
            .map(|r| r.instance)
            .collect();
        names.sort();
        shapes.push(names);
    }
    assert!(shapes.windows(2).all(|w| w[0] == w[1]));
}
