//! Process configuration.
//!
//! A job is described by one YAML document:
//!
//! ```yaml
//! process_name: RECO
//! source:
//!   module_type: EmptyEvent
//!   maxEvents: 10
//! services:
//!   scheduler:
//!     fileMode: FULLMERGE
//!     num_schedules: 2
//! physics:
//!   producers:
//!     ints: { module_type: IntProducer, value: 7 }
//!   analyzers:
//!     check: { module_type: ProductChecker, input: ints, expected: 7 }
//!   p1: [ints]
//!   e1: [check, out]
//! outputs:
//!   out: { module_type: JsonlOutput, fileName: out.jsonl }
//! ```
//!
//! Values from the command line and the environment are applied on top of
//! the file by the CLI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::FrameworkError;

pub mod params;

pub use params::ParameterSet;

/// Environment variable overriding the number of schedules
pub const NUM_SCHEDULES_ENV: &str = "HEPFLOW_NUM_SCHEDULES";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Name of this processing step, recorded in every product
    #[serde(default = "default_process_name")]
    pub process_name: String,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub physics: PhysicsConfig,

    /// Output modules (may also be given as `physics.outputs`)
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

fn default_process_name() -> String {
    "PROD".to_string()
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            source: SourceConfig::default(),
            services: ServicesConfig::default(),
            physics: PhysicsConfig::default(),
            outputs: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, FrameworkError> {
        serde_yaml::from_str(text).map_err(|e| {
            FrameworkError::configuration(format!("Failed to parse process configuration: {}", e))
        })
    }

    /// Output module tables from both accepted locations
    pub fn output_tables(&self) -> Vec<(&String, &Value)> {
        self.outputs
            .iter()
            .chain(self.physics.outputs.iter())
            .collect()
    }

    /// Validated scheduler options
    pub fn file_mode(&self) -> Result<FileMode, FrameworkError> {
        self.services.scheduler.file_mode.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Registered source type
    #[serde(default = "default_source_type")]
    pub module_type: String,

    /// Maximum number of events to read (-1 = unlimited)
    #[serde(default = "default_limit", rename = "maxEvents")]
    pub max_events: i64,

    /// Maximum number of subruns to read (-1 = unlimited)
    #[serde(default = "default_limit", rename = "maxSubRuns")]
    pub max_subruns: i64,

    /// Runs, RunsAndSubRuns or RunsSubRunsAndEvents
    #[serde(default = "default_processing_mode", rename = "processingMode")]
    pub processing_mode: String,

    /// Source specific parameters
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

fn default_source_type() -> String {
    "EmptyEvent".to_string()
}
fn default_limit() -> i64 {
    -1
}
fn default_processing_mode() -> String {
    "RunsSubRunsAndEvents".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            module_type: default_source_type(),
            max_events: default_limit(),
            max_subruns: default_limit(),
            processing_mode: default_processing_mode(),
            params: BTreeMap::new(),
        }
    }
}

impl SourceConfig {
    pub fn parameter_set(&self) -> ParameterSet {
        ParameterSet::from_map(&self.params)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default, rename = "RandomNumberGenerator")]
    pub random_numbers: Option<RandomNumberConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// MERGE, NOMERGE, FULLMERGE or FULLLUMIMERGE; empty means FULLMERGE
    #[serde(default)]
    pub file_mode: String,

    /// Begin runs that contain no subruns
    #[serde(default = "default_true")]
    pub handle_empty_runs: bool,

    /// Begin subruns that contain no events
    #[serde(default = "default_true")]
    pub handle_empty_sub_runs: bool,

    #[serde(default = "default_num_schedules", rename = "num_schedules")]
    pub num_schedules: usize,

    /// Log a trigger report at end of job
    #[serde(default)]
    pub want_summary: bool,

    /// Write the module graph as Graphviz dot to this file
    #[serde(default)]
    pub data_dependency_graph: Option<PathBuf>,

    #[serde(default, rename = "Rethrow")]
    pub rethrow: Vec<String>,

    #[serde(default, rename = "SkipEvent")]
    pub skip_event: Vec<String>,

    #[serde(default, rename = "FailPath")]
    pub fail_path: Vec<String>,

    #[serde(default, rename = "FailModule")]
    pub fail_module: Vec<String>,

    #[serde(default, rename = "IgnoreCompletely")]
    pub ignore_completely: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_num_schedules() -> usize {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            file_mode: String::new(),
            handle_empty_runs: true,
            handle_empty_sub_runs: true,
            num_schedules: default_num_schedules(),
            want_summary: false,
            data_dependency_graph: None,
            rethrow: Vec::new(),
            skip_event: Vec::new(),
            fail_path: Vec::new(),
            fail_module: Vec::new(),
            ignore_completely: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomNumberConfig {
    /// Where to write the engine snapshot on abnormal termination
    #[serde(default)]
    pub save_to: Option<PathBuf>,

    /// Snapshot to restore engines from at construction
    #[serde(default)]
    pub restore_from: Option<PathBuf>,
}

/// Module tables, path lists and path definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicsConfig {
    #[serde(default)]
    pub producers: BTreeMap<String, Value>,

    #[serde(default)]
    pub filters: BTreeMap<String, Value>,

    #[serde(default)]
    pub analyzers: BTreeMap<String, Value>,

    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,

    /// Trigger paths to activate (all when absent)
    #[serde(default)]
    pub trigger_paths: Option<Vec<String>>,

    /// End paths to activate (all when absent)
    #[serde(default)]
    pub end_paths: Option<Vec<String>>,

    /// Every other key names a path
    #[serde(flatten)]
    pub paths: BTreeMap<String, Value>,
}

/// Output merging policy across input files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    /// Outputs stay open; runs and subruns are finalized at every input file
    Merge,
    /// Outputs are reopened at every input file
    NoMerge,
    /// Runs and subruns continuing across input files are merged
    FullMerge,
    /// Like `FullMerge`, and finished subruns are held until their run ends
    FullLumiMerge,
}

impl FromStr for FileMode {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "FULLMERGE" => Ok(Self::FullMerge),
            "MERGE" => Ok(Self::Merge),
            "NOMERGE" => Ok(Self::NoMerge),
            "FULLLUMIMERGE" => Ok(Self::FullLumiMerge),
            other => Err(FrameworkError::configuration(format!(
                "Illegal fileMode parameter value '{}'; legal values are 'MERGE', 'NOMERGE', 'FULLMERGE' and 'FULLLUMIMERGE'",
                other
            ))),
        }
    }
}

impl FileMode {
    pub fn merges_across_files(self) -> bool {
        matches!(self, Self::FullMerge | Self::FullLumiMerge)
    }
}

/// Load and parse a process configuration file
pub fn load_config_file(path: &Path) -> Result<ProcessConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("job.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
process_name: RECO
source:
  module_type: EmptyEvent
  maxEvents: 5
  numberEventsInSubRun: 2
services:
  scheduler:
    fileMode: NOMERGE
    handleEmptyRuns: false
    num_schedules: 3
    SkipEvent: [ProductNotFound]
physics:
  producers:
    ints: {{ module_type: IntProducer }}
  trigger_paths: [p1]
  p1: [ints]
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.process_name, "RECO");
        assert_eq!(config.source.max_events, 5);
        assert_eq!(config.source.max_subruns, -1);
        assert_eq!(config.source.processing_mode, "RunsSubRunsAndEvents");
        assert_eq!(
            config.source.parameter_set().get::<u32>("numberEventsInSubRun").unwrap(),
            2
        );
        assert_eq!(config.file_mode().unwrap(), FileMode::NoMerge);
        assert!(!config.services.scheduler.handle_empty_runs);
        assert!(config.services.scheduler.handle_empty_sub_runs);
        assert_eq!(config.services.scheduler.num_schedules, 3);
        assert_eq!(config.services.scheduler.skip_event, vec!["ProductNotFound"]);
        assert_eq!(config.physics.trigger_paths, Some(vec!["p1".to_string()]));
        assert!(config.physics.paths.contains_key("p1"));
        assert!(config.physics.producers.contains_key("ints"));
    }

    #[test]
    fn test_file_mode_parsing() {
        assert_eq!("".parse::<FileMode>().unwrap(), FileMode::FullMerge);
        assert_eq!("MERGE".parse::<FileMode>().unwrap(), FileMode::Merge);
        assert_eq!("FULLLUMIMERGE".parse::<FileMode>().unwrap(), FileMode::FullLumiMerge);
        assert!(matches!(
            "SOMETIMES".parse::<FileMode>(),
            Err(FrameworkError::Configuration(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ProcessConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.process_name, "PROD");
        assert_eq!(config.source.module_type, "EmptyEvent");
        assert_eq!(config.services.scheduler.num_schedules, 1);
        assert!(config.services.random_numbers.is_none());
        assert!(config.output_tables().is_empty());
    }
}
