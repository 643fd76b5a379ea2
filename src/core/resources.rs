//! Shared-resource registry and serial chains.
//!
//! Every named resource owns one mutex. A worker's serial chain holds the
//! mutexes of the resources its module declared, always locked in sorted
//! name order so two chains can never deadlock. Legacy modules take every
//! resource plus the legacy one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::lock;

/// Resource every legacy module is serialized on
pub const LEGACY_RESOURCE: &str = "__legacy__";

#[derive(Debug, Default)]
pub struct SharedResources {
    resources: BTreeMap<String, Arc<Mutex<()>>>,
}

impl SharedResources {
    pub fn new() -> Self {
        let mut resources = Self::default();
        resources.register(LEGACY_RESOURCE);
        resources
    }

    pub fn register(&mut self, name: &str) {
        self.resources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Chain for a module declaring `names`; `legacy` takes everything
    pub fn chain_for(&mut self, names: &[String], legacy: bool) -> SerialChain {
        let mut locks = Vec::new();
        if legacy {
            for (name, mutex) in &self.resources {
                locks.push((name.clone(), Arc::clone(mutex)));
            }
        } else {
            for name in names {
                self.register(name);
            }
            for (name, mutex) in &self.resources {
                if names.contains(name) {
                    locks.push((name.clone(), Arc::clone(mutex)));
                }
            }
        }
        SerialChain { locks }
    }
}

/// Ordered resource locks held around each module call
#[derive(Debug, Clone, Default)]
pub struct SerialChain {
    locks: Vec<(String, Arc<Mutex<()>>)>,
}

impl SerialChain {
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.locks.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let guards: Vec<_> = self.locks.iter().map(|(_, m)| lock(m)).collect();
        let result = f();
        drop(guards);
        result
    }
}
