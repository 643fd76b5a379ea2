//! Product identity, input tags and the product registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FrameworkError;

/// Which kind of occurrence a product lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    Run,
    SubRun,
    Event,
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Run => "Run",
            Self::SubRun => "SubRun",
            Self::Event => "Event",
        };
        f.write_str(name)
    }
}

/// Full signature of a stored product
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub friendly_class_name: String,
    pub module_label: String,
    pub instance: String,
    pub process: String,
}

impl ProductKey {
    pub fn new(
        friendly_class_name: impl Into<String>,
        module_label: impl Into<String>,
        instance: impl Into<String>,
        process: impl Into<String>,
    ) -> Self {
        Self {
            friendly_class_name: friendly_class_name.into(),
            module_label: module_label.into(),
            instance: instance.into(),
            process: process.into(),
        }
    }

    /// Branch-style name, `class_label_instance_process`
    pub fn branch_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.friendly_class_name, self.module_label, self.instance, self.process
        )
    }

    pub fn matches(&self, class: &str, tag: &InputTag) -> bool {
        self.friendly_class_name == class
            && self.module_label == tag.label
            && self.instance == tag.instance
            && (tag.process.is_empty() || self.process == tag.process)
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.branch_name())
    }
}

/// A product declared by a module at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescription {
    pub branch_type: BranchType,
    pub key: ProductKey,
}

/// Selects a product by module label, instance and process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct InputTag {
    pub label: String,
    pub instance: String,
    pub process: String,
}

impl InputTag {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = process.into();
        self
    }
}

impl FromStr for InputTag {
    type Err = FrameworkError;

    /// Parse `label`, `label:instance` or `label:instance:process`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.is_empty() || parts.len() > 3 || parts[0].is_empty() {
            return Err(FrameworkError::configuration(format!(
                "Input tag '{}' must look like label, label:instance or label:instance:process",
                s
            )));
        }
        Ok(Self {
            label: parts[0].to_string(),
            instance: parts.get(1).unwrap_or(&"").to_string(),
            process: parts.get(2).unwrap_or(&"").to_string(),
        })
    }
}

impl fmt::Display for InputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.label, self.instance, self.process)
    }
}

/// Products known to one processor.
///
/// Filled while modules are constructed and frozen before the first item
/// is processed; a fresh, empty registry belongs to every processor.
#[derive(Debug, Default)]
pub struct ProductRegistry {
    products: BTreeMap<(BranchType, ProductKey), ProductDescription>,
    frozen: bool,
}

impl ProductRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, desc: ProductDescription) -> Result<(), FrameworkError> {
        if self.frozen {
            return Err(FrameworkError::logic(format!(
                "Cannot register product {} after the product registry was frozen",
                desc.key
            )));
        }
        let key = (desc.branch_type, desc.key.clone());
        if self.products.contains_key(&key) {
            return Err(FrameworkError::configuration(format!(
                "Product {} is declared more than once for the {}",
                desc.key, desc.branch_type
            )));
        }
        self.products.insert(key, desc);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn clear(&mut self) {
        self.products.clear();
        self.frozen = false;
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductDescription> {
        self.products.values()
    }

    pub fn produced_by<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a ProductDescription> {
        self.products
            .values()
            .filter(move |d| d.key.module_label == label)
    }
}
