//! Command-line interface for hepflow.
//!
//! Provides commands for running a configured job, validating its paths
//! and module dependencies, writing the dependency graph and listing the
//! registered plugins.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_yaml::{Mapping, Value};
use tracing::{error, info, warn};

use crate::config::{load_config_file, ProcessConfig, NUM_SCHEDULES_ENV};
use crate::core::{EventProcessor, PluginRegistry, ShutdownFlag, TriggerReport};
use crate::domain::StatusCode;
use crate::error::FrameworkError;

/// Exit code used when the configuration cannot be used
pub const CONFIGURATION_EXIT_CODE: i32 = 2;

/// Label of the output module added by `--output` when none is configured
const DEFAULT_OUTPUT_LABEL: &str = "out";

/// Name of the end path holding that output module
const DEFAULT_END_PATH: &str = "hepflow_end_path";

/// hepflow - event-processing framework
#[derive(Parser, Debug)]
#[command(name = "hepflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process the job described by a configuration file
    Run {
        /// Process configuration (YAML)
        config: PathBuf,

        /// Number of events to process (-1 = all)
        #[arg(short = 'n', long)]
        nevts: Option<i64>,

        /// Number of events to skip before processing
        #[arg(long)]
        nskip: Option<i64>,

        /// Number of schedules processing events concurrently
        #[arg(short = 'j', long, env = NUM_SCHEDULES_ENV)]
        nschedules: Option<usize>,

        /// Input manifest files, replacing the configured source
        #[arg(short, long, num_args = 1..)]
        source: Vec<PathBuf>,

        /// Output file for the job's output module
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate paths and the module dependency graph
    Check {
        /// Process configuration (YAML)
        config: PathBuf,
    },

    /// Write the module dependency graph in Graphviz dot format
    Graph {
        /// Process configuration (YAML)
        config: PathBuf,

        /// Destination of the dot file
        out: PathBuf,
    },

    /// List registered module and source types
    Plugins,
}

/// Command-line values applied on top of a configuration file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub nevts: Option<i64>,
    pub nschedules: Option<usize>,
    pub source: Vec<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                config,
                nevts,
                nskip,
                nschedules,
                source,
                output,
            } => {
                let overrides = Overrides {
                    nevts,
                    nschedules,
                    source,
                    output,
                };
                run_job(&config, overrides, nskip).await
            }
            Commands::Check { config } => check_config(&config),
            Commands::Graph { config, out } => write_graph(&config, &out),
            Commands::Plugins => {
                list_plugins();
                Ok(())
            }
        }
    }
}

/// Apply command-line overrides to a loaded configuration
pub fn apply_overrides(config: &mut ProcessConfig, overrides: &Overrides) -> Result<()> {
    if let Some(n) = overrides.nevts {
        config.source.max_events = n;
    }
    if let Some(n) = overrides.nschedules {
        anyhow::ensure!(n > 0, "The number of schedules must be at least 1");
        config.services.scheduler.num_schedules = n;
    }
    if !overrides.source.is_empty() {
        config.source.module_type = "ManifestInput".to_string();
        config.source.params.remove("files");
        let names = overrides
            .source
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect();
        config
            .source
            .params
            .insert("fileNames".to_string(), Value::Sequence(names));
    }
    if let Some(path) = &overrides.output {
        set_output_file(config, path)?;
    }
    Ok(())
}

fn set_output_file(config: &mut ProcessConfig, path: &Path) -> Result<()> {
    let file_name = Value::String(path.display().to_string());
    let configured = config.outputs.len() + config.physics.outputs.len();
    match configured {
        0 => {
            let mut table = Mapping::new();
            table.insert("module_type".into(), "JsonlOutput".into());
            table.insert("fileName".into(), file_name);
            config
                .outputs
                .insert(DEFAULT_OUTPUT_LABEL.to_string(), Value::Mapping(table));
            config.physics.paths.insert(
                DEFAULT_END_PATH.to_string(),
                Value::Sequence(vec![DEFAULT_OUTPUT_LABEL.into()]),
            );
            if let Some(end_paths) = config.physics.end_paths.as_mut() {
                end_paths.push(DEFAULT_END_PATH.to_string());
            }
            Ok(())
        }
        1 => {
            let (label, table) = config
                .outputs
                .iter_mut()
                .chain(config.physics.outputs.iter_mut())
                .next()
                .context("Output module table disappeared")?;
            match table {
                Value::Mapping(m) => {
                    m.insert("fileName".into(), file_name);
                    Ok(())
                }
                _ => anyhow::bail!("Output module '{}' is not a table", label),
            }
        }
        n => anyhow::bail!(
            "--output needs exactly one configured output module, found {}",
            n
        ),
    }
}

fn load_with_overrides(path: &Path, overrides: &Overrides) -> Result<ProcessConfig> {
    let mut config = load_config_file(path)?;
    apply_overrides(&mut config, overrides)?;
    Ok(config)
}

/// Outcome of one job executed on the processing thread
struct JobOutcome {
    status: StatusCode,
    events: u64,
    report: TriggerReport,
}

/// Why a job did not finish
enum JobFailure {
    /// The processor could not be built from the configuration
    Setup(FrameworkError),
    Processing(FrameworkError),
}

fn process(
    config: &ProcessConfig,
    flag: ShutdownFlag,
    nskip: Option<i64>,
) -> Result<JobOutcome, JobFailure> {
    let registry = PluginRegistry::with_builtins();
    let mut processor = EventProcessor::new(config, &registry)
        .map_err(JobFailure::Setup)?
        .with_shutdown_flag(flag);
    let mut run = || -> Result<StatusCode, FrameworkError> {
        processor.begin_job()?;
        if let Some(n) = nskip.filter(|n| *n > 0) {
            processor.skip_events(n)?;
        }
        let status = processor.run_to_completion()?;
        processor.end_job()?;
        Ok(status)
    };
    let status = run().map_err(|e| match e {
        FrameworkError::Configuration(_) => JobFailure::Setup(e),
        other => JobFailure::Processing(other),
    })?;
    Ok(JobOutcome {
        status,
        events: processor.events_processed(),
        report: processor.trigger_report(),
    })
}

/// Run a job to completion, exiting with its status code
async fn run_job(config_path: &Path, overrides: Overrides, nskip: Option<i64>) -> Result<()> {
    let config = match load_with_overrides(config_path, &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            eprintln!("\n[Configuration error: {:#}]", e);
            std::process::exit(CONFIGURATION_EXIT_CODE);
        }
    };
    info!(
        process = %config.process_name,
        config = %config_path.display(),
        "Starting job"
    );

    let flag = ShutdownFlag::new();
    let signal_flag = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current item");
            signal_flag.request();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || process(&config, flag, nskip))
        .await
        .context("Processing thread failed")?;

    match outcome {
        Ok(outcome) => {
            info!(
                status = %outcome.status,
                events = outcome.events,
                passed = outcome.report.end_path.passed,
                "Job finished"
            );
            let code = outcome.status.code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(JobFailure::Setup(e)) => {
            error!(category = e.category(), "Configuration rejected");
            eprintln!("\n[{}]", e);
            std::process::exit(CONFIGURATION_EXIT_CODE);
        }
        Err(JobFailure::Processing(e)) => {
            error!(category = e.category(), "Job failed");
            eprintln!("\n[Job failed: {}]", e);
            std::process::exit(StatusCode::Exception.code());
        }
    }
}

/// Build the processor without running it and print what was configured
fn check_config(config_path: &Path) -> Result<()> {
    let config = load_config_file(config_path)?;
    let registry = PluginRegistry::with_builtins();
    let processor = EventProcessor::new(&config, &registry)
        .with_context(|| format!("Configuration {} is not valid", config_path.display()))?;

    println!("Process: {}", processor.process_name());
    println!("Schedules: {}", processor.num_schedules());
    println!("Products: {}", processor.product_registry().len());
    println!("\nModules:");
    for node in processor.graph().nodes() {
        let deps = processor.graph().data_dependencies(node);
        if deps.is_empty() {
            println!("  {}", node);
        } else {
            println!("  {} <- {}", node, deps.join(", "));
        }
    }
    println!("\nConfiguration is valid");
    Ok(())
}

fn write_graph(config_path: &Path, out: &Path) -> Result<()> {
    let config = load_config_file(config_path)?;
    let registry = PluginRegistry::with_builtins();
    let processor = EventProcessor::new(&config, &registry)
        .with_context(|| format!("Configuration {} is not valid", config_path.display()))?;

    std::fs::write(out, processor.graph().to_dot())
        .with_context(|| format!("Failed to write graph: {}", out.display()))?;
    println!("Wrote {}", out.display());
    Ok(())
}

fn list_plugins() {
    let registry = PluginRegistry::with_builtins();
    println!("Sources:");
    for name in registry.source_types() {
        println!("  {}", name);
    }
    println!("\nModules:");
    for name in registry.module_types() {
        if let Ok(plugin) = registry.module(name) {
            println!("  {:<20} {:<14} {:?}", name, plugin.kind.to_string(), plugin.threading);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> ProcessConfig {
        ProcessConfig::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "hepflow", "run", "job.yaml", "-n", "10", "-j", "4", "-s", "a.txt", "b.txt", "-o",
            "out.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                nevts,
                nschedules,
                source,
                output,
                ..
            } => {
                assert_eq!(nevts, Some(10));
                assert_eq!(nschedules, Some(4));
                assert_eq!(source.len(), 2);
                assert_eq!(output, Some(PathBuf::from("out.jsonl")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_overrides_replace_source_and_limits() {
        let mut c = config("source: { module_type: EmptyEvent, maxEvents: 3 }\n");
        let overrides = Overrides {
            nevts: Some(7),
            nschedules: Some(2),
            source: vec![PathBuf::from("files.txt")],
            output: None,
        };
        apply_overrides(&mut c, &overrides).unwrap();
        assert_eq!(c.source.max_events, 7);
        assert_eq!(c.services.scheduler.num_schedules, 2);
        assert_eq!(c.source.module_type, "ManifestInput");
        assert_eq!(
            c.source.parameter_set().get::<Vec<String>>("fileNames").unwrap(),
            vec!["files.txt"]
        );

        let zero = Overrides {
            nschedules: Some(0),
            ..Default::default()
        };
        assert!(apply_overrides(&mut c, &zero).is_err());
    }

    #[test]
    fn test_output_override_sets_or_adds_output() {
        let mut c = config(
            "outputs:\n  o1: { module_type: JsonlOutput, fileName: a.jsonl }\nphysics:\n  e1: [o1]\n",
        );
        set_output_file(&mut c, Path::new("b.jsonl")).unwrap();
        assert_eq!(c.outputs["o1"]["fileName"], Value::from("b.jsonl"));

        let mut c = config("physics:\n  end_paths: [e1]\n  e1: []\n");
        set_output_file(&mut c, Path::new("c.jsonl")).unwrap();
        assert!(c.outputs.contains_key(DEFAULT_OUTPUT_LABEL));
        assert!(c.physics.paths.contains_key(DEFAULT_END_PATH));
        assert_eq!(
            c.physics.end_paths,
            Some(vec!["e1".to_string(), DEFAULT_END_PATH.to_string()])
        );

        let mut c = config(
            "outputs:\n  o1: { module_type: JsonlOutput, fileName: a }\n  o2: { module_type: JsonlOutput, fileName: b }\n",
        );
        assert!(set_output_file(&mut c, Path::new("d.jsonl")).is_err());
    }
}
