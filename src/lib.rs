//! hepflow - event-processing framework
//!
//! Drives a stream of input files, runs, subruns and events through
//! configured paths of producer, filter, analyzer and output modules.
//!
//! # Architecture
//!
//! The system is built around an explicit state machine:
//! - An input source announces items one at a time
//! - The state machine opens and closes files, runs and subruns in nesting order
//! - Each event runs through every trigger path of a schedule, then the end path
//! - Any failure leaving the loop tears the machine down and is reported once
//!
//! # Modules
//!
//! - `config`: YAML process configuration and module parameter sets
//! - `core`: State machine, event processor, schedules, paths and workers
//! - `domain`: Ids, items, principals, products and status codes
//! - `error`: Error vocabulary
//! - `modules`: Built-in modules
//! - `source`: Input sources and the read-ahead protocol
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Process a job
//! hepflow run job.yaml -n 100 -j 4
//!
//! # Validate paths and dependencies
//! hepflow check job.yaml
//!
//! # Draw the module dependency graph
//! hepflow graph job.yaml deps.dot
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod modules;
pub mod source;

// Re-export main types at crate root for convenience
pub use config::{FileMode, ParameterSet, ProcessConfig};
pub use core::{EventProcessor, ModuleSetup, PluginRegistry, ShutdownFlag, TriggerReport};
pub use domain::{EventId, RunId, StatusCode, SubRunId};
pub use error::{FrameworkError, ModuleError, ProcessingError};
