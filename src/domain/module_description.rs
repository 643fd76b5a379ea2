//! Module identity assigned at construction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capability set of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Producer,
    Filter,
    Analyzer,
    Output,
}

impl ModuleKind {
    /// Producers and filters modify the event; analyzers and outputs only observe
    pub fn is_modifier(self) -> bool {
        matches!(self, Self::Producer | Self::Filter)
    }

    /// Name of the configuration table holding modules of this kind
    pub fn table(self) -> &'static str {
        match self {
            Self::Producer => "producers",
            Self::Filter => "filters",
            Self::Analyzer => "analyzers",
            Self::Output => "outputs",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Producer => "producer",
            Self::Filter => "filter",
            Self::Analyzer => "analyzer",
            Self::Output => "output module",
        };
        f.write_str(name)
    }
}

/// How a module may be used by concurrent schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleThreading {
    /// One instance, serialized against every shared resource
    Legacy,
    /// One instance shared by all schedules
    Shared,
    /// One instance per schedule
    Replicated,
}

/// Immutable identity of a configured module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescription {
    /// Label the module is configured under
    pub label: String,

    /// Registered plugin type name
    pub module_type: String,

    /// Hash of the module's configuration
    pub parameter_set_id: String,

    pub kind: ModuleKind,

    pub threading: ModuleThreading,

    /// Name of the process the module runs in
    pub process_name: String,
}

impl fmt::Display for ModuleDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module_type, self.label)
    }
}
