//! Module dependency graph.
//!
//! Nodes are the source, every module on an active path, and the trigger
//! results. A module depends on the modules whose products it consumes, on
//! the module before it on each path, and (for end-path modules) on the
//! trigger results, which in turn depend on every trigger-path module.
//! Data dependencies between trigger-path modules must stay within one path
//! and point backwards along it, and the whole graph must be acyclic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use super::module::ConsumesInfo;
use super::path_manager::PathManager;
use crate::domain::{BranchType, ModuleKind, ProductDescription};
use crate::error::FrameworkError;

pub const SOURCE_NODE: &str = "*source*";
pub const TRIGGER_RESULTS_NODE: &str = "TriggerResults";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    /// Consumes a product of the target
    Data,
    /// Follows the target on a path
    Path,
    /// Waits for the target to finish
    Sync,
}

impl EdgeKind {
    fn style(self) -> &'static str {
        match self {
            Self::Data => "",
            Self::Path => " [style=dashed]",
            Self::Sync => " [style=dotted]",
        }
    }
}

/// What a constructed module declared
#[derive(Debug, Clone)]
pub struct ModuleDeclarations {
    pub kind: ModuleKind,
    pub produces: Vec<ProductDescription>,
    pub consumes: Vec<ConsumesInfo>,
    pub consumes_many: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    nodes: BTreeSet<String>,
    /// (dependent, dependency, kind)
    edges: BTreeSet<(String, String, EdgeKind)>,
}

impl ModuleGraph {
    /// Build and validate the graph for the active paths
    pub fn build(
        paths: &PathManager,
        declarations: &BTreeMap<String, ModuleDeclarations>,
        process_name: &str,
    ) -> Result<Self, FrameworkError> {
        let mut graph = Self::default();
        let mut errors = Vec::new();
        graph.nodes.insert(SOURCE_NODE.to_string());
        graph.nodes.insert(TRIGGER_RESULTS_NODE.to_string());
        for label in declarations.keys() {
            graph.nodes.insert(label.clone());
        }

        let trigger_labels = paths.trigger_labels();
        for path in paths.trigger_paths().iter().chain(paths.end_path()) {
            let labels: Vec<&str> = path.labels().collect();
            for pair in labels.windows(2) {
                graph.add_edge(pair[1], pair[0], EdgeKind::Path);
            }
        }
        for label in &trigger_labels {
            graph.add_edge(TRIGGER_RESULTS_NODE, label, EdgeKind::Sync);
        }
        if let Some(end) = paths.end_path() {
            for label in end.labels() {
                graph.add_edge(label, TRIGGER_RESULTS_NODE, EdgeKind::Sync);
            }
        }

        for (label, decl) in declarations {
            for consumed in &decl.consumes {
                graph.resolve_consumes(label, consumed, paths, declarations, process_name, &mut errors);
            }
            for class in &decl.consumes_many {
                for path in paths.trigger_paths().iter().filter(|p| p.contains(label)) {
                    for earlier in path.labels().take_while(|l| *l != label.as_str()) {
                        let produces_class = declarations.get(earlier).map_or(false, |d| {
                            d.produces
                                .iter()
                                .any(|p| p.branch_type == BranchType::Event && &p.key.friendly_class_name == class)
                        });
                        if produces_class {
                            graph.add_edge(label, earlier, EdgeKind::Data);
                        }
                    }
                }
            }
        }

        if let Err(cycle) = graph.check_cycles() {
            errors.push(cycle);
        }

        if errors.is_empty() {
            Ok(graph)
        } else {
            Err(FrameworkError::Collected {
                context: "The following were encountered while processing the module graph".to_string(),
                messages: errors,
            })
        }
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        if from != to {
            self.edges.insert((from.to_string(), to.to_string(), kind));
        }
    }

    fn resolve_consumes(
        &mut self,
        label: &str,
        consumed: &ConsumesInfo,
        paths: &PathManager,
        declarations: &BTreeMap<String, ModuleDeclarations>,
        process_name: &str,
        errors: &mut Vec<String>,
    ) {
        let tag = &consumed.tag;
        let other_process = !tag.process.is_empty() && tag.process != process_name;
        let producer = declarations.get(&tag.label).filter(|_| !other_process);
        let Some(producer) = producer else {
            if !tag.process.is_empty() && tag.process == process_name {
                errors.push(format!(
                    "Module '{}' consumes {} product '{}' from module '{}' of process '{}', but no such module is on an active path",
                    label, consumed.branch_type, consumed.class, tag.label, process_name
                ));
            } else if !other_process && paths.is_inactive(&tag.label) {
                errors.push(format!(
                    "Module '{}' consumes {} product '{}' from module '{}', which is configured but not on any active path",
                    label, consumed.branch_type, consumed.class, tag.label
                ));
            } else {
                // produced upstream and read from the input
                self.add_edge(label, SOURCE_NODE, EdgeKind::Data);
            }
            return;
        };

        let produced = producer.produces.iter().any(|p| {
            p.branch_type == consumed.branch_type
                && p.key.friendly_class_name == consumed.class
                && p.key.instance == tag.instance
        });
        if !produced {
            errors.push(format!(
                "Module '{}' consumes {} product '{}' with instance '{}' from module '{}', which does not produce it",
                label, consumed.branch_type, consumed.class, tag.instance, tag.label
            ));
            return;
        }
        self.add_edge(label, &tag.label, EdgeKind::Data);

        if consumed.branch_type != BranchType::Event {
            return;
        }
        for path in paths.trigger_paths().iter().filter(|p| p.contains(label)) {
            match (path.position(&tag.label), path.position(label)) {
                (None, _) => errors.push(format!(
                    "Module '{}' on path '{}' depends on '{}', which is not on the same path",
                    label, path.name, tag.label
                )),
                (Some(producer_at), Some(consumer_at)) if producer_at > consumer_at => errors.push(format!(
                    "Module '{}' on path '{}' depends on '{}', which appears later on that path",
                    label, path.name, tag.label
                )),
                _ => {}
            }
        }
    }

    /// Depth-first search over dependencies, reporting the first cycle
    fn check_cycles(&self) -> Result<(), String> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (from, to, _) in &self.edges {
            adjacency.entry(from.as_str()).or_default().push(to.as_str());
        }

        let mut done = BTreeSet::new();
        for start in adjacency.keys() {
            let mut on_path = BTreeSet::new();
            let mut trail = Vec::new();
            visit(start, &adjacency, &mut done, &mut on_path, &mut trail)?;
        }
        Ok(())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, EdgeKind)> {
        self.edges.iter().map(|(a, b, k)| (a.as_str(), b.as_str(), *k))
    }

    /// Labels `label` directly depends on through data edges
    pub fn data_dependencies(&self, label: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(from, _, kind)| from == label && *kind == EdgeKind::Data)
            .map(|(_, to, _)| to.as_str())
            .collect()
    }

    /// Graphviz rendering; edges point from a dependency to its dependent
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph modules {\n");
        for node in &self.nodes {
            let _ = writeln!(out, "  \"{}\";", node);
        }
        for (from, to, kind) in &self.edges {
            let _ = writeln!(out, "  \"{}\" -> \"{}\"{};", to, from, kind.style());
        }
        out.push_str("}\n");
        out
    }
}

fn visit<'a>(
    node: &'a str,
    adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
    done: &mut BTreeSet<&'a str>,
    on_path: &mut BTreeSet<&'a str>,
    trail: &mut Vec<&'a str>,
) -> Result<(), String> {
    if on_path.contains(node) {
        trail.push(node);
        let start = trail.iter().position(|n| *n == node).unwrap_or(0);
        return Err(format!(
            "Dependency cycle among modules: {}",
            trail[start..].join(" → ")
        ));
    }
    if done.contains(node) {
        return Ok(());
    }
    on_path.insert(node);
    trail.push(node);
    if let Some(next) = adjacency.get(node) {
        for dep in next {
            visit(dep, adjacency, done, on_path, trail)?;
        }
    }
    on_path.remove(node);
    trail.pop();
    done.insert(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::core::registry::PluginRegistry;
    use crate::domain::{InputTag, ProductKey};

    fn declarations(pm: &PathManager, consumes: &[(&str, &str)]) -> BTreeMap<String, ModuleDeclarations> {
        pm.modules()
            .iter()
            .map(|(label, m)| {
                let produces = if m.kind == ModuleKind::Producer {
                    vec![ProductDescription {
                        branch_type: BranchType::Event,
                        key: ProductKey::new("int", label.as_str(), "", "TEST"),
                    }]
                } else {
                    vec![]
                };
                let consumes = consumes
                    .iter()
                    .filter(|(c, _)| c == label)
                    .map(|(_, p)| ConsumesInfo {
                        branch_type: BranchType::Event,
                        class: "int".into(),
                        tag: InputTag::new(*p),
                    })
                    .collect();
                (
                    label.clone(),
                    ModuleDeclarations {
                        kind: m.kind,
                        produces,
                        consumes,
                        consumes_many: vec![],
                    },
                )
            })
            .collect()
    }

    fn paths(yaml: &str) -> PathManager {
        let config = ProcessConfig::from_yaml_str(yaml).unwrap();
        PathManager::new(&config, &PluginRegistry::with_builtins()).unwrap()
    }

    const TWO_PATHS: &str = r#"
physics:
  producers:
    a: { module_type: IntProducer, value: 1 }
    b: { module_type: IntProducer, value: 2 }
  analyzers:
    count: { module_type: EventCounter }
  p1: [a, b]
  p2: [b]
  e1: [count]
"#;

    #[test]
    fn test_valid_graph_and_dot() {
        let pm = paths(TWO_PATHS);
        let decls = declarations(&pm, &[("b", "a"), ("count", "b"), ("a", "input")]);
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        // b also runs on p2, where a is absent
        assert!(err.contains("Module 'b' on path 'p2' depends on 'a', which is not on the same path"));

        let pm = paths(&TWO_PATHS.replace("p2: [b]", "p2: [a, b]"));
        let decls = declarations(&pm, &[("b", "a"), ("count", "b"), ("a", "input")]);
        let graph = ModuleGraph::build(&pm, &decls, "TEST").unwrap();
        assert_eq!(graph.data_dependencies("b"), vec!["a"]);
        assert_eq!(graph.data_dependencies("a"), vec![SOURCE_NODE]);
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph modules {"));
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("\"TriggerResults\" -> \"count\" [style=dotted];"));
    }

    #[test]
    fn test_order_and_cycle_errors() {
        let pm = paths(&TWO_PATHS.replace("p2: [b]", "p2: [b, a]"));
        let decls = declarations(&pm, &[]);
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        assert!(err.contains("Dependency cycle among modules"));
        assert!(err.contains(" → "));

        let pm = paths(&TWO_PATHS.replace("p2: [b]", "p2: [a]"));
        let decls = declarations(&pm, &[("a", "b")]);
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        assert!(err.contains("Module 'a' on path 'p1' depends on 'b', which appears later on that path"));
    }

    #[test]
    fn test_unknown_module_of_this_process_is_an_error() {
        let pm = paths(TWO_PATHS);
        let mut decls = declarations(&pm, &[]);
        decls.get_mut("count").unwrap().consumes.push(ConsumesInfo {
            branch_type: BranchType::Event,
            class: "int".into(),
            tag: "typo::TEST".parse().unwrap(),
        });
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        assert!(err.contains("from module 'typo' of process 'TEST', but no such module is on an active path"));

        // the same label from an earlier process is read from the input
        let mut decls = declarations(&pm, &[]);
        decls.get_mut("count").unwrap().consumes.push(ConsumesInfo {
            branch_type: BranchType::Event,
            class: "int".into(),
            tag: "typo::SIM".parse().unwrap(),
        });
        let graph = ModuleGraph::build(&pm, &decls, "TEST").unwrap();
        assert_eq!(graph.data_dependencies("count"), vec![SOURCE_NODE]);
    }

    #[test]
    fn test_module_off_every_active_path_is_an_error() {
        let pm = paths(&TWO_PATHS.replace(
            "  analyzers:",
            "    spare: { module_type: IntProducer, value: 3 }\n  analyzers:",
        ));
        assert!(pm.module("spare").is_none());
        assert!(pm.is_inactive("spare"));

        let mut decls = declarations(&pm, &[]);
        decls.get_mut("count").unwrap().consumes.push(ConsumesInfo {
            branch_type: BranchType::Event,
            class: "int".into(),
            tag: InputTag::new("spare"),
        });
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        assert!(err.contains("from module 'spare', which is configured but not on any active path"));
    }

    #[test]
    fn test_unproduced_product_is_an_error() {
        let pm = paths(TWO_PATHS);
        let mut decls = declarations(&pm, &[]);
        decls.get_mut("count").unwrap().consumes.push(ConsumesInfo {
            branch_type: BranchType::Event,
            class: "float".into(),
            tag: InputTag::new("a"),
        });
        let err = ModuleGraph::build(&pm, &decls, "TEST").unwrap_err().to_string();
        assert!(err.contains("Module 'count' consumes Event product 'float' with instance '' from module 'a'"));
    }
}
