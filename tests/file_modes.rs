//! File Mode Integration Tests
//!
//! Tests for how runs and subruns continuing across input files are
//! begun, merged and written under each file mode.

use std::path::Path;

use hepflow::config::ProcessConfig;
use hepflow::core::{EventProcessor, PluginRegistry};
use hepflow::domain::StatusCode;
use serde_json::Value;
use tempfile::TempDir;

const MANIFEST: &str = r#"
  files:
    - name: a.data
      process_history: [SIM]
      runs:
        - run: 1
          products: [{ class: int, label: lumi, value: 10 }]
          subruns:
            - { subrun: 0, events: [1, 2], products: [{ class: int, label: nev, value: 2 }] }
    - name: b.data
      process_history: [SIM]
      runs:
        - run: 1
          products: [{ class: int, label: lumi, value: 5 }]
          subruns:
            - { subrun: 0, events: [3], products: [{ class: int, label: nev, value: 1 }] }
        - run: 2
          subruns:
            - { subrun: 0, events: [1] }
"#;

fn run_mode(mode: &str, expected_runs: u32, expected_subruns: u32, out: &Path) -> Vec<Value> {
    run_job(MANIFEST, mode, (4, expected_subruns, expected_runs), out)
}

/// Run a job over `manifest`, expecting (events, subruns, runs) to begin,
/// and return the output records
fn run_job(manifest: &str, mode: &str, expected: (u32, u32, u32), out: &Path) -> Vec<Value> {
    let (expected_events, expected_subruns, expected_runs) = expected;
    let yaml = format!(
        r#"
process_name: RECO
source:
  module_type: ManifestInput
{manifest}
services:
  scheduler: {{ fileMode: {mode} }}
physics:
  analyzers:
    count: {{ module_type: EventCounter, expected: {events}, expectedRuns: {runs}, expectedSubRuns: {subruns} }}
  e1: [count, out]
outputs:
  out: {{ module_type: JsonlOutput, fileName: "{out}" }}
"#,
        manifest = manifest,
        mode = mode,
        events = expected_events,
        runs = expected_runs,
        subruns = expected_subruns,
        out = out.display()
    );
    let config = ProcessConfig::from_yaml_str(&yaml).unwrap();
    let mut p = EventProcessor::new(&config, &PluginRegistry::with_builtins()).unwrap();
    p.begin_job().unwrap();
    assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
    p.end_job().unwrap();

    std::fs::read_to_string(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn of_kind<'a>(records: &'a [Value], kind: &str) -> Vec<&'a Value> {
    records.iter().filter(|r| r["record"] == kind).collect()
}

fn run_numbers(records: &[Value]) -> Vec<u64> {
    of_kind(records, "run")
        .iter()
        .map(|r| r["run"].as_u64().unwrap())
        .collect()
}

#[test]
fn test_full_merge_merges_continued_run() {
    let dir = TempDir::new().unwrap();
    let records = run_mode("FULLMERGE", 2, 2, &dir.path().join("out.jsonl"));

    assert_eq!(of_kind(&records, "header").len(), 1);
    assert_eq!(run_numbers(&records), vec![1, 2]);
    let runs = of_kind(&records, "run");
    assert_eq!(runs[0]["products"]["int_lumi__SIM"], 15);

    let subruns = of_kind(&records, "subrun");
    assert_eq!(subruns.len(), 2);
    assert_eq!(subruns[0]["products"]["int_nev__SIM"], 3);
}

#[test]
fn test_merge_ends_runs_at_file_boundary() {
    let dir = TempDir::new().unwrap();
    let records = run_mode("MERGE", 3, 3, &dir.path().join("out.jsonl"));

    assert_eq!(of_kind(&records, "header").len(), 1);
    assert_eq!(run_numbers(&records), vec![1, 1, 2]);
    let runs = of_kind(&records, "run");
    assert_eq!(runs[0]["products"]["int_lumi__SIM"], 10);
    assert_eq!(runs[1]["products"]["int_lumi__SIM"], 5);
}

#[test]
fn test_no_merge_reopens_outputs_per_input_file() {
    let dir = TempDir::new().unwrap();
    let records = run_mode("NOMERGE", 3, 3, &dir.path().join("out.jsonl"));

    let headers = of_kind(&records, "header");
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[0]["input_file"], "a.data");
    assert_eq!(headers[1]["input_file"], "b.data");
    assert_eq!(of_kind(&records, "trailer").len(), 2);
    assert_eq!(run_numbers(&records), vec![1, 1, 2]);
}

#[test]
fn test_full_lumi_merge_writes_subruns_with_their_run() {
    let dir = TempDir::new().unwrap();
    let records = run_mode("FULLLUMIMERGE", 2, 2, &dir.path().join("out.jsonl"));

    assert_eq!(run_numbers(&records), vec![1, 2]);
    let subruns = of_kind(&records, "subrun");
    assert_eq!(subruns.len(), 2);
    assert_eq!(subruns[0]["products"]["int_nev__SIM"], 3);

    // subrun 1:0 is only written once run 1 has ended, after event 3
    let kinds: Vec<&str> = records.iter().map(|r| r["record"].as_str().unwrap()).collect();
    let first_subrun = kinds.iter().position(|k| *k == "subrun").unwrap();
    let events_before = kinds[..first_subrun].iter().filter(|k| **k == "event").count();
    assert_eq!(events_before, 3);
}

#[test]
fn test_out_of_order_runs_are_written_in_order() {
    let manifest = r#"
  files:
    - name: a.data
      process_history: [SIM]
      runs:
        - run: 2
          products: [{ class: int, label: lumi, value: 2 }]
          subruns:
            - { subrun: 0, events: [1] }
    - name: b.data
      process_history: [SIM]
      runs:
        - run: 1
          products: [{ class: int, label: lumi, value: 1 }]
          subruns:
            - { subrun: 0, events: [1] }
        - run: 3
          subruns:
            - { subrun: 0, events: [1] }
"#;
    let dir = TempDir::new().unwrap();
    let records = run_job(manifest, "FULLMERGE", (3, 3, 3), &dir.path().join("out.jsonl"));

    assert_eq!(run_numbers(&records), vec![1, 2, 3]);
    let runs = of_kind(&records, "run");
    assert_eq!(runs[0]["products"]["int_lumi__SIM"], 1);
    assert_eq!(runs[1]["products"]["int_lumi__SIM"], 2);
}

#[test]
fn test_illegal_file_mode_lists_legal_values() {
    let config = ProcessConfig::from_yaml_str("services:\n  scheduler: { fileMode: SOMETIMES }\n").unwrap();
    let err = EventProcessor::new(&config, &PluginRegistry::with_builtins())
        .unwrap_err()
        .to_string();
    assert!(err.contains("SOMETIMES"));
    assert!(err.contains("FULLMERGE"));
}
