//! Plugin registry.
//!
//! Module and source types are registered by name at startup; the process
//! configuration refers to them through `module_type`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::module::{ModuleInstance, ModuleSetup};
use crate::config::ParameterSet;
use crate::domain::{ModuleDescription, ModuleKind, ModuleThreading};
use crate::error::FrameworkError;
use crate::source::{EmptyEvent, ManifestSource, RawSource};

pub type ModuleFactory = Arc<
    dyn Fn(&ModuleDescription, &ParameterSet, &mut ModuleSetup) -> Result<ModuleInstance, FrameworkError>
        + Send
        + Sync,
>;

pub type SourceFactory =
    Arc<dyn Fn(&ParameterSet) -> Result<Box<dyn RawSource>, FrameworkError> + Send + Sync>;

/// A registered module type
#[derive(Clone)]
pub struct ModulePlugin {
    pub kind: ModuleKind,
    pub threading: ModuleThreading,
    factory: ModuleFactory,
}

impl ModulePlugin {
    pub fn make(
        &self,
        description: &ModuleDescription,
        pset: &ParameterSet,
        setup: &mut ModuleSetup,
    ) -> Result<ModuleInstance, FrameworkError> {
        let instance = (self.factory)(description, pset, setup)?;
        if instance.kind() != self.kind {
            return Err(FrameworkError::logic(format!(
                "Factory for '{}' registered as a {} built a {}",
                description.module_type,
                self.kind,
                instance.kind()
            )));
        }
        Ok(instance)
    }
}

impl fmt::Debug for ModulePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModulePlugin")
            .field("kind", &self.kind)
            .field("threading", &self.threading)
            .finish()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    modules: BTreeMap<String, ModulePlugin>,
    sources: BTreeMap<String, SourceFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sources and modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source("EmptyEvent", |pset| {
            Ok(Box::new(EmptyEvent::from_parameters(pset)?) as Box<dyn RawSource>)
        });
        registry.register_source("ManifestInput", |pset| {
            Ok(Box::new(ManifestSource::from_parameters(pset)?) as Box<dyn RawSource>)
        });
        crate::modules::register_builtins(&mut registry);
        registry
    }

    pub fn register_module<F>(
        &mut self,
        module_type: &str,
        kind: ModuleKind,
        threading: ModuleThreading,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&ModuleDescription, &ParameterSet, &mut ModuleSetup) -> Result<ModuleInstance, FrameworkError>
            + Send
            + Sync
            + 'static,
    {
        self.modules.insert(
            module_type.to_string(),
            ModulePlugin {
                kind,
                threading,
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn register_source<F>(&mut self, source_type: &str, factory: F) -> &mut Self
    where
        F: Fn(&ParameterSet) -> Result<Box<dyn RawSource>, FrameworkError> + Send + Sync + 'static,
    {
        self.sources.insert(source_type.to_string(), Arc::new(factory));
        self
    }

    pub fn module(&self, module_type: &str) -> Result<&ModulePlugin, FrameworkError> {
        self.modules.get(module_type).ok_or_else(|| {
            FrameworkError::configuration(format!(
                "Unknown module type '{}'; registered types are: {}",
                module_type,
                self.module_types().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn make_source(&self, source_type: &str, pset: &ParameterSet) -> Result<Box<dyn RawSource>, FrameworkError> {
        let factory = self.sources.get(source_type).ok_or_else(|| {
            FrameworkError::configuration(format!(
                "Unknown source type '{}'; registered types are: {}",
                source_type,
                self.source_types().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(pset)
    }

    pub fn module_types(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn source_types(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}
