//! Compare a product against an expected value.

use serde_json::Value;
use tracing::debug;

use crate::config::ParameterSet;
use crate::core::{Analyzer, DataView, Event, Module, ModuleSetup, Run, SubRun};
use crate::domain::{BranchType, InputTag};
use crate::error::{FrameworkError, ModuleError};

/// Reads the product selected by `input` (of class `class`, default `int`)
/// from every event, subrun or run according to `branchType`, and fails
/// with `ProductMismatch` when it differs from `expected`.
#[derive(Debug)]
pub struct ProductChecker {
    label: String,
    class: String,
    tag: InputTag,
    expected: Value,
    branch_type: BranchType,
    checked: u64,
}

impl ProductChecker {
    pub fn new(pset: &ParameterSet, setup: &mut ModuleSetup) -> Result<Self, FrameworkError> {
        let tag: InputTag = pset.get::<String>("input")?.parse()?;
        let class = pset.get_or("class", "int".to_string())?;
        let expected = pset.get::<Value>("expected")?;
        let branch_type = match pset.get_or("branchType", "Event".to_string())?.as_str() {
            "Event" => BranchType::Event,
            "SubRun" => BranchType::SubRun,
            "Run" => BranchType::Run,
            other => {
                return Err(FrameworkError::configuration(format!(
                    "Illegal branchType '{}'; legal values are 'Event', 'SubRun' and 'Run'",
                    other
                )))
            }
        };
        setup.consumes_in(branch_type, &class, tag.clone());
        Ok(Self {
            label: setup.label().to_string(),
            class,
            tag,
            expected,
            branch_type,
            checked: 0,
        })
    }

    fn check<I>(&mut self, view: &DataView<'_, I>) -> Result<(), ModuleError>
    where
        I: Copy + PartialEq + std::fmt::Display,
    {
        let found = view.get::<Value>(&self.class, &self.tag)?;
        if found != self.expected {
            return Err(ModuleError::new(
                "ProductMismatch",
                format!(
                    "{} product {} in {} is {} but {} was expected",
                    self.class,
                    self.tag,
                    view.id(),
                    found,
                    self.expected
                ),
            ));
        }
        self.checked += 1;
        Ok(())
    }
}

impl Module for ProductChecker {
    fn end_subrun(&mut self, subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        if self.branch_type == BranchType::SubRun {
            self.check(subrun)?;
        }
        Ok(())
    }

    fn end_run(&mut self, run: &mut Run<'_>) -> Result<(), ModuleError> {
        if self.branch_type == BranchType::Run {
            self.check(run)?;
        }
        Ok(())
    }

    fn end_job(&mut self) -> Result<(), ModuleError> {
        debug!(module = %self.label, checked = self.checked, "Product checks passed");
        Ok(())
    }
}

impl Analyzer for ProductChecker {
    fn analyze(&mut self, event: &Event<'_>) -> Result<(), ModuleError> {
        if self.branch_type == BranchType::Event {
            self.check(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, EventPrincipal, ProcessHistory, ProductKey};

    fn checker(yaml: &str) -> ProductChecker {
        let pset: ParameterSet = serde_yaml::from_str(yaml).unwrap();
        let mut setup = ModuleSetup::new("check", "TEST", 0, None);
        let checker = ProductChecker::new(&pset, &mut setup).unwrap();
        assert_eq!(setup.consumed().len(), 1);
        checker
    }

    fn event_with(value: i64) -> EventPrincipal {
        let mut principal = EventPrincipal::new(EventId::new(1, 0, 1), ProcessHistory::default());
        principal
            .put(ProductKey::new("int", "ints", "", "TEST"), serde_json::json!(value))
            .unwrap();
        principal
    }

    #[test]
    fn test_matching_product_passes() {
        let mut c = checker("input: ints\nexpected: 3\n");
        let principal = event_with(3);
        let event = Event::new(&principal, BranchType::Event, "check", "TEST", &[]);
        c.analyze(&event).unwrap();
        assert_eq!(c.checked, 1);
    }

    #[test]
    fn test_mismatch_and_missing_products_fail() {
        let mut c = checker("input: ints\nexpected: 4\n");
        let principal = event_with(3);
        let event = Event::new(&principal, BranchType::Event, "check", "TEST", &[]);
        assert_eq!(c.analyze(&event).unwrap_err().category, "ProductMismatch");

        let mut c = checker("input: other\nexpected: 3\n");
        assert_eq!(c.analyze(&event).unwrap_err().category, "ProductNotFound");
    }

    #[test]
    fn test_requires_input_and_expected() {
        let mut setup = ModuleSetup::new("check", "TEST", 0, None);
        let pset: ParameterSet = serde_yaml::from_str("input: ints\n").unwrap();
        assert!(ProductChecker::new(&pset, &mut setup).is_err());
        let pset: ParameterSet = serde_yaml::from_str("input: 'a:b:c:d'\nexpected: 1\n").unwrap();
        assert!(ProductChecker::new(&pset, &mut setup).is_err());
    }
}
