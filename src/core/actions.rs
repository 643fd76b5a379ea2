//! Exception action table.
//!
//! Maps an error category to what the scheduler does when a module fails
//! with it. Categories not listed are rethrown; out-of-memory failures are
//! always rethrown.

use std::collections::HashMap;
use std::fmt;

use crate::config::SchedulerConfig;
use crate::error::{FrameworkError, OUT_OF_MEMORY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Propagate and end processing
    Rethrow,
    /// Abandon the rest of the event; end paths are not run
    SkipEvent,
    /// Mark the current path as failed and continue with the next path
    FailPath,
    /// Treat the module as a filter that rejected the event
    FailModule,
    /// Treat the module as if it passed
    IgnoreCompletely,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    map: HashMap<String, Action>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, FrameworkError> {
        let mut table = Self::new();
        let lists = [
            (Action::Rethrow, &config.rethrow),
            (Action::SkipEvent, &config.skip_event),
            (Action::FailPath, &config.fail_path),
            (Action::FailModule, &config.fail_module),
            (Action::IgnoreCompletely, &config.ignore_completely),
        ];
        for (action, categories) in lists {
            for category in categories {
                table.add(category, action)?;
            }
        }
        Ok(table)
    }

    pub fn add(&mut self, category: &str, action: Action) -> Result<(), FrameworkError> {
        if let Some(existing) = self.map.get(category) {
            if *existing != action {
                return Err(FrameworkError::configuration(format!(
                    "Error category '{}' is configured for both {} and {}",
                    category, existing, action
                )));
            }
        }
        self.map.insert(category.to_string(), action);
        Ok(())
    }

    pub fn find(&self, category: &str) -> Action {
        if category == OUT_OF_MEMORY {
            return Action::Rethrow;
        }
        self.map.get(category).copied().unwrap_or(Action::Rethrow)
    }

    /// Action for failures outside event processing
    pub fn find_for_occurrence(&self, category: &str) -> Action {
        match self.find(category) {
            Action::IgnoreCompletely => Action::IgnoreCompletely,
            _ => Action::Rethrow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let config = SchedulerConfig {
            skip_event: vec!["NotFound".into()],
            ignore_completely: vec!["Harmless".into(), OUT_OF_MEMORY.into()],
            ..Default::default()
        };
        let table = ActionTable::from_config(&config).unwrap();
        assert_eq!(table.find("NotFound"), Action::SkipEvent);
        assert_eq!(table.find("Harmless"), Action::IgnoreCompletely);
        assert_eq!(table.find("Other"), Action::Rethrow);
        assert_eq!(table.find(OUT_OF_MEMORY), Action::Rethrow);
        assert_eq!(table.find_for_occurrence("NotFound"), Action::Rethrow);
        assert_eq!(table.find_for_occurrence("Harmless"), Action::IgnoreCompletely);
    }

    #[test]
    fn test_conflicting_actions_rejected() {
        let config = SchedulerConfig {
            fail_path: vec!["X".into()],
            fail_module: vec!["X".into()],
            ..Default::default()
        };
        assert!(ActionTable::from_config(&config).is_err());
    }
}
