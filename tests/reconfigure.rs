//! Dynamic reconfiguration: property changes after traffic re-run
//! `configure_port` downstream, and configuration is idempotent.

use sluice::error::{Error, Result};
use sluice::filter::{ConfigureOutcome, Filter, FilterCtx, ProcessStatus};
use sluice::port::{InputPort, OutputPort};
use sluice::props::{PropKey, PropValue, PropertyMap};
use sluice::registry::{CapBundle, CapPredicate, FilterDescriptor, FilterRegistry};
use sluice::session::Session;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Emits three packets at width 640, installs a new snapshot at width
/// 1920, emits three more, then ends.
struct SwitchingSource {
    emitted: u64,
}

fn switching_source() -> Arc<FilterDescriptor> {
    FilterDescriptor::builder("switching-src")
        .factory(|_| Ok(Box::new(SwitchingSource { emitted: 0 })))
        .build_shared()
}

impl Filter for SwitchingSource {
    fn initialize(&mut self, ctx: &mut FilterCtx<'_>) -> Result<()> {
        ctx.add_output(
            "out",
            PropertyMap::new()
                .with(PropKey::CodecId, "raw")
                .with(PropKey::Width, 640u32),
        );
        Ok(())
    }

    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(out) = ctx.outputs.first() else {
            return ProcessStatus::Eos;
        };
        while self.emitted < 6 {
            if out.would_block() {
                return ProcessStatus::Ok;
            }
            if self.emitted == 3 {
                out.set_props(
                    PropertyMap::new()
                        .with(PropKey::CodecId, "raw")
                        .with(PropKey::Width, 1920u32),
                );
            }
            if out.send(out.new_packet(1)).is_err() {
                return ProcessStatus::Fatal {
                    reason: "send failed".into(),
                };
            }
            self.emitted += 1;
        }
        ProcessStatus::Eos
    }
}

#[derive(Default)]
struct ConfigLog {
    widths: Mutex<Vec<u64>>,
    packets: AtomicUsize,
}

/// Sink recording the upstream width at every `configure_port` call.
struct RecordingSink {
    log: Arc<ConfigLog>,
}

fn recording_sink(log: Arc<ConfigLog>) -> Arc<FilterDescriptor> {
    FilterDescriptor::builder("recording-sink")
        .input_bundle(CapBundle::new().with(CapPredicate::require(PropKey::CodecId, "raw")))
        .factory(move |_| {
            Ok(Box::new(RecordingSink {
                log: Arc::clone(&log),
            }))
        })
        .build_shared()
}

impl Filter for RecordingSink {
    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        let width = port
            .props()
            .get(&PropKey::Width)
            .and_then(PropValue::as_uint)
            .unwrap_or(0);
        self.log.widths.lock().unwrap().push(width);
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(input) = ctx.inputs.first() else {
            return ProcessStatus::Ok;
        };
        while input.front().is_some() {
            input.drop_front().unwrap();
            self.log.packets.fetch_add(1, Ordering::AcqRel);
        }
        if input.is_eos() {
            ProcessStatus::Eos
        } else {
            ProcessStatus::Ok
        }
    }
}

#[test]
fn test_property_change_reconfigures_downstream() {
    let log = Arc::new(ConfigLog::default());
    let registry = Arc::new(FilterRegistry::new());
    registry.register(recording_sink(Arc::clone(&log))).unwrap();
    registry.register(switching_source()).unwrap();

    let session = Session::new(registry);
    session.add_filter("switching-src", &[]).unwrap();
    session.run().unwrap();

    assert_eq!(log.packets.load(Ordering::Acquire), 6);
    // Exactly two configurations: link time at 640, then the
    // mid-stream switch to 1920. No spurious re-calls.
    assert_eq!(*log.widths.lock().unwrap(), vec![640, 1920]);
}

/// Advertises an oversized width, then narrows it when asked to adapt
/// its output.
struct AdaptingSource {
    emitted: u64,
}

fn adapting_source() -> Arc<FilterDescriptor> {
    FilterDescriptor::builder("adapting-src")
        .factory(|_| Ok(Box::new(AdaptingSource { emitted: 0 })))
        .build_shared()
}

impl Filter for AdaptingSource {
    fn initialize(&mut self, ctx: &mut FilterCtx<'_>) -> Result<()> {
        ctx.add_output(
            "out",
            PropertyMap::new()
                .with(PropKey::CodecId, "adapt")
                .with(PropKey::Width, 4096u32),
        );
        Ok(())
    }

    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        _port: &InputPort,
        _is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(out) = ctx.outputs.first() else {
            return ProcessStatus::Eos;
        };
        while self.emitted < 3 {
            if out.would_block() {
                return ProcessStatus::Ok;
            }
            if out.send(out.new_packet(1)).is_err() {
                return ProcessStatus::Fatal {
                    reason: "send failed".into(),
                };
            }
            self.emitted += 1;
        }
        ProcessStatus::Eos
    }

    fn reconfigure_output(&mut self, port: &OutputPort) -> Result<()> {
        port.set_props(
            PropertyMap::new()
                .with(PropKey::CodecId, "adapt")
                .with(PropKey::Width, 1920u32),
        );
        Ok(())
    }
}

/// Rejects any link wider than 1920.
struct LimitedSink {
    log: Arc<ConfigLog>,
}

fn limited_sink(log: Arc<ConfigLog>) -> Arc<FilterDescriptor> {
    FilterDescriptor::builder("limited-sink")
        .input_bundle(CapBundle::new().with(CapPredicate::require(PropKey::CodecId, "adapt")))
        .factory(move |_| {
            Ok(Box::new(LimitedSink {
                log: Arc::clone(&log),
            }))
        })
        .build_shared()
}

impl Filter for LimitedSink {
    fn configure_port(
        &mut self,
        _ctx: &mut FilterCtx<'_>,
        port: &InputPort,
        is_remove: bool,
    ) -> Result<ConfigureOutcome> {
        if is_remove {
            return Ok(ConfigureOutcome::Ok);
        }
        let width = port
            .props()
            .get(&PropKey::Width)
            .and_then(PropValue::as_uint)
            .unwrap_or(0);
        if width > 1920 {
            return Err(Error::Configuration {
                filter: "limited-sink".into(),
                reason: format!("width {width} unsupported"),
            });
        }
        self.log.widths.lock().unwrap().push(width);
        Ok(ConfigureOutcome::Ok)
    }

    fn process(&mut self, ctx: &mut FilterCtx<'_>) -> ProcessStatus {
        let Some(input) = ctx.inputs.first() else {
            return ProcessStatus::Ok;
        };
        while input.front().is_some() {
            input.drop_front().unwrap();
            self.log.packets.fetch_add(1, Ordering::AcqRel);
        }
        if input.is_eos() {
            ProcessStatus::Eos
        } else {
            ProcessStatus::Ok
        }
    }
}

#[test]
fn test_rejected_link_asks_producer_to_adapt_output() {
    let log = Arc::new(ConfigLog::default());
    let registry = Arc::new(FilterRegistry::new());
    registry.register(limited_sink(Arc::clone(&log))).unwrap();
    registry.register(adapting_source()).unwrap();

    let session = Session::new(registry);
    session.add_filter("adapting-src", &[]).unwrap();
    session.run().unwrap();

    // The sink saw only the adapted snapshot, never the oversized one.
    assert_eq!(*log.widths.lock().unwrap(), vec![1920]);
    assert_eq!(log.packets.load(Ordering::Acquire), 3);
}

#[test]
fn test_configure_is_idempotent() {
    // Calling configure_port repeatedly with identical properties must
    // succeed every time with the same outcome.
    use sluice::filter::OptionValues;
    use sluice::packet::PacketAccounting;
    use sluice::port::{OutputPort, WaterMarks};

    let log = Arc::new(ConfigLog::default());
    let desc = recording_sink(Arc::clone(&log));
    let mut sink = desc.instantiate(&OptionValues::default()).unwrap();

    let out = OutputPort::new("out", PacketAccounting::new(), WaterMarks::default());
    out.set_props(
        PropertyMap::new()
            .with(PropKey::CodecId, "raw")
            .with(PropKey::Width, 640u32),
    );
    let input = out.connect().unwrap();

    let inputs: Vec<InputPort> = Vec::new();
    let outputs: Vec<OutputPort> = Vec::new();
    let mut ctx = FilterCtx::new(&inputs, &outputs);
    for _ in 0..3 {
        assert_eq!(
            sink.configure_port(&mut ctx, &input, false).unwrap(),
            ConfigureOutcome::Ok
        );
    }
    assert_eq!(*log.widths.lock().unwrap(), vec![640, 640, 640]);
}
