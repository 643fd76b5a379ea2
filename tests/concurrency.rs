//! Concurrency Integration Tests
//!
//! Tests for multi-schedule processing and shared-resource serialization.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hepflow::config::ProcessConfig;
use hepflow::core::{Event, EventProcessor, Module, ModuleInstance, PluginRegistry, Producer, Run, SubRun};
use hepflow::domain::{EventId, ModuleKind, ModuleThreading, StatusCode};
use hepflow::error::{FailureKind, FrameworkError, ModuleError, OpenOccurrence};
use serde_json::Value;
use tempfile::TempDir;

/// Observes how many holders of a resource are active at once
#[derive(Default)]
struct Probe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

struct Holder {
    probe: Arc<Probe>,
    fail_at: Option<u32>,
}

impl Module for Holder {}

impl Producer for Holder {
    fn produce(&mut self, event: &mut Event<'_>) -> Result<(), ModuleError> {
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(event.id().event) {
            return Err(ModuleError::new("Boom", "holder failed"));
        }
        Ok(())
    }
}

fn registry(probe: &Arc<Probe>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    let probe = probe.clone();
    registry.register_module(
        "DbWriter",
        ModuleKind::Producer,
        ModuleThreading::Replicated,
        move |_, pset, setup| {
            let resources: Vec<String> = pset.get_or("resources", vec!["DB".to_string()])?;
            let names: Vec<&str> = resources.iter().map(String::as_str).collect();
            setup.serialize(&names);
            Ok(ModuleInstance::Producer(Box::new(Holder {
                probe: probe.clone(),
                fail_at: pset.get_opt("failAt")?,
            })))
        },
    );
    registry
}

fn processor(yaml: &str, probe: &Arc<Probe>) -> EventProcessor {
    let config = ProcessConfig::from_yaml_str(yaml).unwrap();
    EventProcessor::new(&config, &registry(probe)).unwrap()
}

#[test]
fn test_serialized_modules_never_overlap() {
    let probe = Arc::new(Probe::default());
    let mut p = processor(
        r#"
source: { module_type: EmptyEvent, maxEvents: 40 }
services:
  scheduler: { num_schedules: 4 }
physics:
  producers:
    a: { module_type: DbWriter }
    b: { module_type: DbWriter }
  p1: [a]
  p2: [b]
"#,
        &probe,
    );
    assert_eq!(p.num_schedules(), 4);
    p.begin_job().unwrap();
    assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
    p.end_job().unwrap();

    assert_eq!(probe.calls.load(Ordering::SeqCst), 80);
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(p.events_processed(), 40);
}

#[test]
fn test_schedules_process_every_event_once() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("events.jsonl");
    let probe = Arc::new(Probe::default());
    let mut p = processor(
        &format!(
            r#"
source: {{ module_type: EmptyEvent, maxEvents: 25, numberEventsInSubRun: 4 }}
services:
  scheduler: {{ num_schedules: 3 }}
physics:
  producers:
    ints: {{ module_type: IntProducer, value: 7 }}
  analyzers:
    check: {{ module_type: ProductChecker, input: ints, expected: 7 }}
    count: {{ module_type: EventCounter, expected: 25, expectedSubRuns: 7 }}
  p1: [ints]
  e1: [check, count, out]
outputs:
  out: {{ module_type: JsonlOutput, fileName: "{}" }}
"#,
            out.display()
        ),
        &probe,
    );
    p.begin_job().unwrap();
    assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
    p.end_job().unwrap();

    let records: Vec<Value> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let events: BTreeSet<u64> = records
        .iter()
        .filter(|r| r["record"] == "event")
        .map(|r| r["event"].as_u64().unwrap())
        .collect();
    assert_eq!(events, (1..=25).collect());

    let subruns: Vec<u64> = records
        .iter()
        .filter(|r| r["record"] == "subrun")
        .map(|r| r["subrun"].as_u64().unwrap())
        .collect();
    assert_eq!(subruns, (0..7).collect::<Vec<_>>());

    let report = p.trigger_report();
    assert_eq!(report.events, 25);
    assert_eq!(report.paths["p1"].passed, 25);
    assert_eq!(report.modules["ints"].run, 25);
}

#[test]
fn test_failure_inside_a_batch_is_normalized() {
    let probe = Arc::new(Probe::default());
    let mut p = processor(
        r#"
source: { module_type: EmptyEvent, maxEvents: 20 }
services:
  scheduler: { num_schedules: 2 }
physics:
  producers:
    a: { module_type: DbWriter, failAt: 5 }
  p1: [a]
"#,
        &probe,
    );
    p.begin_job().unwrap();
    let err = match p.run_to_completion().unwrap_err() {
        FrameworkError::Processing(e) => e,
        other => panic!("expected a processing error, got {}", other),
    };
    assert_eq!(err.kind, FailureKind::Framework("Boom".to_string()));
    assert!(err
        .open_occurrences
        .contains(&OpenOccurrence::Event(EventId::new(1, 0, 5))));
    assert!(probe.calls.load(Ordering::SeqCst) <= 6);
}

#[test]
fn test_async_module_with_serialize_is_rejected() {
    let mut registry = PluginRegistry::with_builtins();
    let probe = Arc::new(Probe::default());
    registry.register_module(
        "AsyncDb",
        ModuleKind::Producer,
        ModuleThreading::Shared,
        move |_, _, setup| {
            setup.serialize(&["DB"]).async_events();
            Ok(ModuleInstance::Producer(Box::new(Holder {
                probe: probe.clone(),
                fail_at: None,
            })))
        },
    );
    let config = ProcessConfig::from_yaml_str(
        "physics:\n  producers:\n    a: { module_type: AsyncDb }\n  p1: [a]\n",
    )
    .unwrap();
    let mut p = EventProcessor::new(&config, &registry).unwrap();
    assert!(matches!(p.begin_job(), Err(FrameworkError::Configuration(_))));
}

/// Producer logging its run and subrun callbacks, failing on one event
struct Bookkeeper {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_at: u32,
}

impl Module for Bookkeeper {
    fn begin_run(&mut self, _run: &mut Run<'_>) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push("begin_run");
        Ok(())
    }

    fn end_run(&mut self, _run: &mut Run<'_>) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push("end_run");
        Ok(())
    }

    fn begin_subrun(&mut self, _subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push("begin_subrun");
        Ok(())
    }

    fn end_subrun(&mut self, _subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push("end_subrun");
        Ok(())
    }
}

impl Producer for Bookkeeper {
    fn produce(&mut self, event: &mut Event<'_>) -> Result<(), ModuleError> {
        if event.id().event == self.fail_at {
            return Err(ModuleError::new("Boom", "bookkeeper failed"));
        }
        Ok(())
    }
}

fn teardown_calls(schedules: usize) -> Vec<&'static str> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::with_builtins();
    let shared = calls.clone();
    registry.register_module(
        "Bookkeeper",
        ModuleKind::Producer,
        ModuleThreading::Shared,
        move |_, pset, _| {
            Ok(ModuleInstance::Producer(Box::new(Bookkeeper {
                calls: shared.clone(),
                fail_at: pset.get("failAt")?,
            })))
        },
    );
    let config = ProcessConfig::from_yaml_str(&format!(
        r#"
source: {{ module_type: EmptyEvent, maxEvents: 3 }}
services:
  scheduler: {{ num_schedules: {} }}
physics:
  producers:
    book: {{ module_type: Bookkeeper, failAt: 3 }}
  p1: [book]
"#,
        schedules
    ))
    .unwrap();
    let mut p = EventProcessor::new(&config, &registry).unwrap();
    p.begin_job().unwrap();
    let err = match p.run_to_completion().unwrap_err() {
        FrameworkError::Processing(e) => e,
        other => panic!("expected a processing error, got {}", other),
    };
    assert!(err
        .open_occurrences
        .contains(&OpenOccurrence::Event(EventId::new(1, 0, 3))));
    let recorded = calls.lock().unwrap().clone();
    recorded
}

#[test]
fn test_failure_in_last_batch_still_ends_subrun_before_run() {
    let expected = vec!["begin_run", "begin_subrun", "end_subrun", "end_run"];
    assert_eq!(teardown_calls(1), expected);
    assert_eq!(teardown_calls(2), expected);
    assert_eq!(teardown_calls(3), expected);
}
