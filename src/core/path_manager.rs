//! Reads module tables and path definitions from the process configuration.
//!
//! Module tables are read in the order producers, filters, analyzers,
//! outputs. Every path is classified by its first entry: a path starting
//! with a producer or filter is a trigger path, one starting with an
//! analyzer or output is an end path. All end paths are merged into the
//! single `end_path`. Problems are collected and reported together.

use std::collections::{BTreeMap, BTreeSet};

use serde_yaml::Value;
use tracing::info;

use super::path::FilterAction;
use super::registry::PluginRegistry;
use crate::config::params::describe;
use crate::config::{ParameterSet, ProcessConfig};
use crate::domain::{ModuleKind, ModuleThreading};
use crate::error::FrameworkError;

/// Name of the merged end path
pub const END_PATH_NAME: &str = "end_path";

/// A module table entry that will be constructed
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub label: String,
    pub module_type: String,
    pub kind: ModuleKind,
    pub threading: ModuleThreading,
    pub pset: ParameterSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub name: String,
    pub entries: Vec<(String, FilterAction)>,
}

impl PathSpec {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(l, _)| l.as_str())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.iter().any(|(l, _)| l == label)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.entries.iter().position(|(l, _)| l == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathCategory {
    Trigger,
    End,
}

#[derive(Debug)]
pub struct PathManager {
    modules: BTreeMap<String, ModuleConfig>,
    trigger_paths: Vec<PathSpec>,
    end_path: Option<PathSpec>,
    /// Configured modules left off every active path
    inactive: BTreeSet<String>,
}

impl PathManager {
    pub fn new(config: &ProcessConfig, registry: &PluginRegistry) -> Result<Self, FrameworkError> {
        let mut errors = Vec::new();
        let modules = read_module_tables(config, registry, &mut errors);

        let mut classified: Vec<(PathSpec, PathCategory)> = Vec::new();
        for (name, value) in &config.physics.paths {
            if let Some(path) = read_path(name, value, &modules, &mut errors) {
                classified.push(path);
            }
        }

        let trigger_paths = select_paths(
            &classified,
            PathCategory::Trigger,
            config.physics.trigger_paths.as_deref(),
            "trigger_paths",
            &mut errors,
        );
        let end_paths = select_paths(
            &classified,
            PathCategory::End,
            config.physics.end_paths.as_deref(),
            "end_paths",
            &mut errors,
        );

        if !errors.is_empty() {
            return Err(FrameworkError::Collected {
                context: "The following were encountered while processing the module configurations".to_string(),
                messages: errors,
            });
        }

        let end_path = merge_end_paths(&end_paths);

        let used: BTreeSet<&str> = trigger_paths
            .iter()
            .chain(end_path.iter())
            .flat_map(|p| p.labels())
            .collect();
        let mut kept = BTreeMap::new();
        let mut inactive = BTreeSet::new();
        for (label, module) in modules {
            if used.contains(label.as_str()) {
                kept.insert(label, module);
            } else {
                info!(module = %label, "Module is not on any active path and will not be constructed");
                inactive.insert(label);
            }
        }

        Ok(Self {
            modules: kept,
            trigger_paths,
            end_path,
            inactive,
        })
    }

    pub fn modules(&self) -> &BTreeMap<String, ModuleConfig> {
        &self.modules
    }

    pub fn module(&self, label: &str) -> Option<&ModuleConfig> {
        self.modules.get(label)
    }

    /// True for a configured module that is on no active path
    pub fn is_inactive(&self, label: &str) -> bool {
        self.inactive.contains(label)
    }

    pub fn trigger_paths(&self) -> &[PathSpec] {
        &self.trigger_paths
    }

    pub fn trigger_path_names(&self) -> Vec<String> {
        self.trigger_paths.iter().map(|p| p.name.clone()).collect()
    }

    pub fn end_path(&self) -> Option<&PathSpec> {
        self.end_path.as_ref()
    }

    /// Labels on trigger paths, in first-appearance order
    pub fn trigger_labels(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.trigger_paths
            .iter()
            .flat_map(|p| p.labels())
            .filter(|l| seen.insert(*l))
            .collect()
    }
}

fn read_module_tables(
    config: &ProcessConfig,
    registry: &PluginRegistry,
    errors: &mut Vec<String>,
) -> BTreeMap<String, ModuleConfig> {
    let outputs = config.output_tables();
    let tables: [(ModuleKind, Vec<(&String, &Value)>); 4] = [
        (ModuleKind::Producer, config.physics.producers.iter().collect()),
        (ModuleKind::Filter, config.physics.filters.iter().collect()),
        (ModuleKind::Analyzer, config.physics.analyzers.iter().collect()),
        (ModuleKind::Output, outputs),
    ];

    let mut modules: BTreeMap<String, ModuleConfig> = BTreeMap::new();
    for (table_kind, entries) in tables {
        for (label, value) in entries {
            if let Some(existing) = modules.get(label) {
                errors.push(format!(
                    "Module label '{}' is used in both '{}' and '{}'",
                    label,
                    existing.kind.table(),
                    table_kind.table()
                ));
                continue;
            }
            let pset = match ParameterSet::from_value(value, &format!("Module '{}'", label)) {
                Ok(pset) => pset,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            let Some(module_type) = pset.module_type().map(str::to_string) else {
                errors.push(format!("Module '{}' has no 'module_type'", label));
                continue;
            };
            let plugin = match registry.module(&module_type) {
                Ok(plugin) => plugin,
                Err(e) => {
                    errors.push(format!("Module '{}': {}", label, e));
                    continue;
                }
            };
            if plugin.kind != table_kind {
                errors.push(format!(
                    "Module '{}' of type '{}' is a {} but is configured in the '{}' table",
                    label,
                    module_type,
                    plugin.kind,
                    table_kind.table()
                ));
                continue;
            }
            modules.insert(
                label.clone(),
                ModuleConfig {
                    label: label.clone(),
                    module_type,
                    kind: plugin.kind,
                    threading: plugin.threading,
                    pset,
                },
            );
        }
    }
    modules
}

fn parse_entry(raw: &str) -> Result<(String, FilterAction), String> {
    let (action, label) = match raw.chars().next() {
        Some('!') => (FilterAction::Veto, &raw[1..]),
        Some('-') => (FilterAction::Ignore, &raw[1..]),
        _ => (FilterAction::Normal, raw),
    };
    if label.starts_with('!') || label.starts_with('-') {
        return Err(format!("Entry '{}' has more than one filter action prefix", raw));
    }
    if label.is_empty() {
        return Err(format!("Entry '{}' has no module label", raw));
    }
    Ok((label.to_string(), action))
}

fn read_path(
    name: &str,
    value: &Value,
    modules: &BTreeMap<String, ModuleConfig>,
    errors: &mut Vec<String>,
) -> Option<(PathSpec, PathCategory)> {
    let Value::Sequence(items) = value else {
        errors.push(format!(
            "Path '{}' must be a sequence of module labels, found {}",
            name,
            describe(value)
        ));
        return None;
    };
    if items.is_empty() {
        info!(path = name, "Path is empty and will be ignored");
        return None;
    }

    let mut entries = Vec::new();
    let mut category = None;
    let mut ok = true;
    for item in items {
        let Some(raw) = item.as_str() else {
            errors.push(format!("Path '{}' contains {} instead of a module label", name, describe(item)));
            ok = false;
            continue;
        };
        let (label, action) = match parse_entry(raw) {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(format!("{} in path '{}'", e, name));
                ok = false;
                continue;
            }
        };
        let Some(module) = modules.get(&label) else {
            errors.push(format!(
                "Entry '{}' in path '{}' refers to a module label that is not configured",
                label, name
            ));
            ok = false;
            continue;
        };
        if action != FilterAction::Normal && module.kind != ModuleKind::Filter {
            errors.push(format!(
                "Entry '{}' in path '{}' has filter action '{}' but is a {}, not a filter",
                raw,
                name,
                action.prefix(),
                module.kind
            ));
            ok = false;
        }
        let this = if module.kind.is_modifier() {
            PathCategory::Trigger
        } else {
            PathCategory::End
        };
        match category {
            None => category = Some(this),
            Some(PathCategory::End) if this == PathCategory::Trigger => {
                errors.push(format!(
                    "Entry '{}' in path '{}' is a modifier while previous entries in the same path are all observers",
                    label, name
                ));
                ok = false;
            }
            Some(PathCategory::Trigger) if this == PathCategory::End => {
                errors.push(format!(
                    "Entry '{}' in path '{}' is an observer while previous entries in the same path are all modifiers",
                    label, name
                ));
                ok = false;
            }
            _ => {}
        }
        entries.push((label, action));
    }

    let category = category?;
    if !ok {
        return None;
    }
    Some((
        PathSpec {
            name: name.to_string(),
            entries,
        },
        category,
    ))
}

fn select_paths(
    classified: &[(PathSpec, PathCategory)],
    category: PathCategory,
    requested: Option<&[String]>,
    list_name: &str,
    errors: &mut Vec<String>,
) -> Vec<PathSpec> {
    let Some(requested) = requested else {
        return classified
            .iter()
            .filter(|(_, c)| *c == category)
            .map(|(p, _)| p.clone())
            .collect();
    };

    let mut selected = Vec::new();
    for name in requested {
        match classified.iter().find(|(p, _)| &p.name == name) {
            None => errors.push(format!("Unknown path '{}' listed in '{}'", name, list_name)),
            Some((_, c)) if *c != category => errors.push(format!(
                "Path '{}' listed in '{}' is {}",
                name,
                list_name,
                match c {
                    PathCategory::Trigger => "a trigger path",
                    PathCategory::End => "an end path",
                }
            )),
            Some((path, _)) => {
                if !selected.iter().any(|p: &PathSpec| p.name == path.name) {
                    selected.push(path.clone());
                }
            }
        }
    }
    for (path, c) in classified {
        if *c == category && !requested.contains(&path.name) {
            info!(path = %path.name, list = list_name, "Path is not listed and will not be run");
        }
    }
    selected
}

fn merge_end_paths(end_paths: &[PathSpec]) -> Option<PathSpec> {
    if end_paths.is_empty() {
        return None;
    }
    let mut entries: Vec<(String, FilterAction)> = Vec::new();
    for path in end_paths {
        for (label, action) in &path.entries {
            if !entries.iter().any(|(l, _)| l == label) {
                entries.push((label.clone(), *action));
            }
        }
    }
    Some(PathSpec {
        name: END_PATH_NAME.to_string(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(yaml: &str) -> Result<PathManager, FrameworkError> {
        let config = ProcessConfig::from_yaml_str(yaml).unwrap();
        PathManager::new(&config, &PluginRegistry::with_builtins())
    }

    #[test]
    fn test_classifies_and_merges_paths() {
        let pm = manager(
            r#"
physics:
  producers:
    a: { module_type: IntProducer, value: 1 }
  filters:
    f: { module_type: Prescaler, prescaleFactor: 2 }
  analyzers:
    count: { module_type: EventCounter }
    unused: { module_type: EventCounter }
  p1: [a, "!f"]
  e1: [count]
  e2: [count]
"#,
        )
        .unwrap();
        assert_eq!(pm.trigger_path_names(), vec!["p1"]);
        assert_eq!(pm.trigger_paths()[0].entries[1], ("f".to_string(), FilterAction::Veto));
        let end = pm.end_path().unwrap();
        assert_eq!(end.name, END_PATH_NAME);
        assert_eq!(end.labels().collect::<Vec<_>>(), vec!["count"]);
        assert!(pm.module("unused").is_none());
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = manager(
            r#"
physics:
  producers:
    a: { module_type: IntProducer, value: 1 }
    wrong: { module_type: EventCounter }
  analyzers:
    count: { module_type: EventCounter }
  p1: [count, a]
  p2: ["!a"]
  p3: [missing]
  p4: ["!!a"]
  p5: notalist
"#,
        )
        .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("The following were encountered while processing the module configurations"));
        assert!(text.contains("Module 'wrong' of type 'EventCounter' is a analyzer"));
        assert!(text.contains("Entry 'a' in path 'p1' is a modifier while previous entries in the same path are all observers"));
        assert!(text.contains("Entry '!a' in path 'p2' has filter action '!'"));
        assert!(text.contains("Entry 'missing' in path 'p3' refers to a module label that is not configured"));
        assert!(text.contains("more than one filter action prefix"));
        assert!(text.contains("Path 'p5' must be a sequence"));
    }

    #[test]
    fn test_path_selection_lists() {
        let yaml = r#"
physics:
  producers:
    a: { module_type: IntProducer, value: 1 }
  analyzers:
    count: { module_type: EventCounter }
  p1: [a]
  p2: [a]
  e1: [count]
  trigger_paths: [p2]
"#;
        let pm = manager(yaml).unwrap();
        assert_eq!(pm.trigger_path_names(), vec!["p2"]);

        let err = manager(&format!("{}  end_paths: [p1, nope]\n", yaml)).unwrap_err().to_string();
        assert!(err.contains("Path 'p1' listed in 'end_paths' is a trigger path"));
        assert!(err.contains("Unknown path 'nope' listed in 'end_paths'"));
    }
}
