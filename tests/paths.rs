//! Path Configuration Integration Tests
//!
//! Tests for path classification, filter actions, module sharing between
//! paths and SelectEvents on the end path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hepflow::config::ProcessConfig;
use hepflow::core::{EventProcessor, Module, ModuleInstance, PluginRegistry, Producer, Event};
use hepflow::domain::{ModuleKind, ModuleThreading, StatusCode};
use hepflow::error::{FrameworkError, ModuleError};

/// Producer counting how often it is invoked
struct Tally(Arc<AtomicUsize>);

impl Module for Tally {}

impl Producer for Tally {
    fn produce(&mut self, _event: &mut Event<'_>) -> Result<(), ModuleError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry_with_tally(calls: &Arc<AtomicUsize>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    let calls = calls.clone();
    registry.register_module(
        "Tally",
        ModuleKind::Producer,
        ModuleThreading::Shared,
        move |_, _, _| Ok(ModuleInstance::Producer(Box::new(Tally(calls.clone())))),
    );
    registry
}

fn build(yaml: &str) -> Result<EventProcessor, FrameworkError> {
    let config = ProcessConfig::from_yaml_str(yaml)?;
    EventProcessor::new(&config, &PluginRegistry::with_builtins())
}

fn run(p: &mut EventProcessor) {
    p.begin_job().unwrap();
    assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
    p.end_job().unwrap();
}

#[test]
fn test_mixed_path_is_rejected_before_processing() {
    let err = build(
        r#"
physics:
  producers:
    ints: { module_type: IntProducer, value: 1 }
  analyzers:
    count: { module_type: EventCounter }
  p1: [ints, count]
"#,
    )
    .unwrap_err()
    .to_string();

    assert!(err.contains("encountered while processing the module configurations"));
    assert!(err.contains(
        "Entry 'count' in path 'p1' is an observer while previous entries in the same path are all modifiers"
    ));
}

#[test]
fn test_observer_first_rejects_later_modifier() {
    let err = build(
        r#"
physics:
  producers:
    ints: { module_type: IntProducer, value: 1 }
  analyzers:
    count: { module_type: EventCounter }
  e1: [count, ints]
"#,
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("is a modifier while previous entries in the same path are all observers"));
}

#[test]
fn test_configuration_errors_are_aggregated() {
    let err = build(
        r#"
physics:
  producers:
    ints: { module_type: IntProducer, value: 1 }
  filters:
    pre: { module_type: Prescaler, prescaleFactor: 2 }
  trigger_paths: [p1, missing]
  p1: ["!ints", nobody, "!-pre"]
"#,
    )
    .unwrap_err()
    .to_string();

    assert!(err.contains("not a filter"));
    assert!(err.contains("Entry 'nobody' in path 'p1' refers to a module label that is not configured"));
    assert!(err.contains("more than one filter action prefix"));
    assert!(err.contains("Unknown path 'missing' listed in 'trigger_paths'"));
}

#[test]
fn test_module_in_wrong_table_is_rejected() {
    let err = build(
        r#"
physics:
  analyzers:
    ints: { module_type: IntProducer, value: 1 }
  p1: [ints]
"#,
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("is a producer but is configured in the 'analyzers' table"));
}

#[test]
fn test_shared_module_runs_once_per_event() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = ProcessConfig::from_yaml_str(
        r#"
source: { module_type: EmptyEvent, maxEvents: 4 }
physics:
  producers:
    tally: { module_type: Tally }
  p1: [tally]
  p2: [tally]
"#,
    )
    .unwrap();
    let mut p = EventProcessor::new(&config, &registry_with_tally(&calls)).unwrap();
    run(&mut p);

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let report = p.trigger_report();
    assert_eq!(report.paths["p1"].passed, 4);
    assert_eq!(report.paths["p2"].passed, 4);
    assert_eq!(report.modules["tally"].run, 4);
    assert_eq!(report.modules["tally"].visited, 8);
}

#[test]
fn test_unlisted_paths_and_unused_modules_are_dropped() {
    let mut p = build(
        r#"
source: { module_type: EmptyEvent, maxEvents: 2 }
physics:
  producers:
    ints: { module_type: IntProducer, value: 1 }
    spare: { module_type: IntProducer, value: 2 }
  trigger_paths: [p1]
  p1: [ints]
  p2: [spare]
"#,
    )
    .unwrap();
    run(&mut p);

    let report = p.trigger_report();
    assert!(report.paths.contains_key("p1"));
    assert!(!report.paths.contains_key("p2"));
    assert!(!report.modules.contains_key("spare"));
}

#[test]
fn test_veto_and_ignore_actions() {
    let mut p = build(
        r#"
source: { module_type: EmptyEvent, maxEvents: 6 }
physics:
  filters:
    pre: { module_type: Prescaler, prescaleFactor: 3 }
  p_normal: [pre]
  p_veto: ["!pre"]
  p_ignore: ["-pre"]
"#,
    )
    .unwrap();
    run(&mut p);

    let report = p.trigger_report();
    assert_eq!(report.paths["p_normal"].passed, 2);
    assert_eq!(report.paths["p_veto"].passed, 4);
    assert_eq!(report.paths["p_ignore"].passed, 6);
    // shared by three paths, the filter still runs once per event
    assert_eq!(report.modules["pre"].run, 6);
}

#[test]
fn test_select_events_limits_end_path_modules() {
    let mut p = build(
        r#"
source: { module_type: EmptyEvent, maxEvents: 6 }
physics:
  filters:
    pre: { module_type: Prescaler, prescaleFactor: 2 }
  analyzers:
    selected: { module_type: EventCounter, expected: 3, SelectEvents: [p1] }
    rejected: { module_type: EventCounter, expected: 3, SelectEvents: ["!p1"] }
    all: { module_type: EventCounter, expected: 6 }
  p1: [pre]
  e1: [selected, rejected, all]
"#,
    )
    .unwrap();
    run(&mut p);
}

#[test]
fn test_select_events_pattern_must_match_a_trigger_path() {
    let err = build(
        r#"
physics:
  filters:
    pre: { module_type: Prescaler, prescaleFactor: 2 }
  analyzers:
    selected: { module_type: EventCounter, SelectEvents: [reco_*] }
  p1: [pre]
  e1: [selected]
"#,
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("SelectEvents pattern 'reco_*' matches no trigger path"));
}

#[test]
fn test_multiple_end_paths_are_coalesced() {
    let mut p = build(
        r#"
source: { module_type: EmptyEvent, maxEvents: 3 }
physics:
  analyzers:
    a: { module_type: EventCounter, expected: 3 }
    b: { module_type: EventCounter, expected: 3 }
  e1: [a]
  e2: [b, a]
"#,
    )
    .unwrap();
    run(&mut p);
    assert_eq!(p.trigger_report().modules["a"].run, 3);
}

#[test]
fn test_consuming_from_a_missing_module_is_rejected() {
    let err = build(
        r#"
process_name: RECO
physics:
  producers:
    ints: { module_type: IntProducer, value: 1 }
    spare: { module_type: IntProducer, value: 2 }
  analyzers:
    typo: { module_type: ProductChecker, input: "intz::RECO", expected: 1 }
    idle: { module_type: ProductChecker, input: spare, expected: 2 }
  p1: [ints]
  e1: [typo, idle]
"#,
    )
    .unwrap_err()
    .to_string();

    assert!(err.contains("encountered while processing the module graph"));
    assert!(err.contains("from module 'intz' of process 'RECO', but no such module is on an active path"));
    assert!(err.contains("from module 'spare', which is configured but not on any active path"));
}
