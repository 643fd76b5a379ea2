//! Input Source Integration Tests
//!
//! Tests for processing modes, read limits and event skipping as seen by
//! modules on the end path.

use hepflow::config::ProcessConfig;
use hepflow::core::{EventProcessor, PluginRegistry};
use hepflow::domain::StatusCode;

const FILES: &str = r#"
  files:
    - name: in.data
      process_history: [SIM]
      runs:
        - run: 1
          subruns:
            - { subrun: 0, events: [1, 2] }
            - { subrun: 1, events: [3] }
        - run: 2
          subruns:
            - { subrun: 0, events: [1] }
"#;

fn processor(source_extra: &str, events: u32, subruns: u32, runs: u32) -> EventProcessor {
    let yaml = format!(
        r#"
source:
  module_type: ManifestInput
{source_extra}{files}
physics:
  analyzers:
    count: {{ module_type: EventCounter, expected: {events}, expectedSubRuns: {subruns}, expectedRuns: {runs} }}
  e1: [count]
"#,
        source_extra = source_extra,
        files = FILES,
        events = events,
        subruns = subruns,
        runs = runs
    );
    let config = ProcessConfig::from_yaml_str(&yaml).unwrap();
    EventProcessor::new(&config, &PluginRegistry::with_builtins()).unwrap()
}

fn run(mut p: EventProcessor) -> EventProcessor {
    p.begin_job().unwrap();
    assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
    p.end_job().unwrap();
    p
}

#[test]
fn test_full_stream_reaches_every_module() {
    let p = run(processor("", 4, 3, 2));
    assert_eq!(p.events_processed(), 4);
}

#[test]
fn test_runs_only_mode_skips_subruns_and_events() {
    let p = run(processor("  processingMode: Runs\n", 0, 0, 2));
    assert_eq!(p.events_processed(), 0);
}

#[test]
fn test_runs_and_subruns_mode_skips_events() {
    run(processor("  processingMode: RunsAndSubRuns\n", 0, 3, 2));
}

#[test]
fn test_subrun_limit_finishes_the_last_subrun() {
    let p = run(processor("  maxSubRuns: 2\n", 3, 2, 1));
    assert_eq!(p.events_processed(), 3);
}

#[test]
fn test_event_limit_stops_inside_a_subrun() {
    let p = run(processor("  maxEvents: 1\n", 1, 1, 1));
    assert_eq!(p.events_processed(), 1);
}

#[test]
fn test_skipped_events_never_reach_modules() {
    let mut p = processor("", 2, 3, 2);
    p.skip_events(2).unwrap();
    let p = run(p);
    assert_eq!(p.events_processed(), 2);
}

#[test]
fn test_illegal_processing_mode_is_rejected() {
    let config = ProcessConfig::from_yaml_str(&format!(
        "source:\n  module_type: ManifestInput\n  processingMode: Everything\n{}",
        FILES
    ))
    .unwrap();
    let err = EventProcessor::new(&config, &PluginRegistry::with_builtins())
        .unwrap_err()
        .to_string();
    assert!(err.contains("processingMode"));
    assert!(err.contains("Everything"));
}
