//! Paths: ordered worker lists evaluated for every event.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use super::actions::{Action, ActionTable};
use super::worker::Worker;
use crate::domain::{EventPrincipal, HltState, TriggerResults};
use crate::error::FrameworkError;

/// How a filter's decision is applied on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Normal,
    /// `!label`: the decision is inverted
    Veto,
    /// `-label`: the decision is ignored
    Ignore,
}

impl FilterAction {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::Veto => "!",
            Self::Ignore => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    /// Index into the owning schedule's workers
    pub worker: usize,
    pub action: FilterAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PathCounters {
    pub run: u64,
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for PathCounters {
    fn add_assign(&mut self, other: Self) {
        self.run += other.run;
        self.passed += other.passed;
        self.failed += other.failed;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone)]
pub struct Path {
    name: String,
    bit: usize,
    entries: Vec<PathEntry>,
    counters: PathCounters,
}

impl Path {
    pub fn new(name: impl Into<String>, bit: usize, entries: Vec<PathEntry>) -> Self {
        Self {
            name: name.into(),
            bit,
            entries,
            counters: PathCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot in the schedule's trigger results
    pub fn bit(&self) -> usize {
        self.bit
    }

    pub fn entries(&self) -> &[PathEntry] {
        &self.entries
    }

    pub fn counters(&self) -> PathCounters {
        self.counters
    }

    /// Run the path's workers in order until one rejects the event.
    ///
    /// Module failures are resolved through the action table; anything not
    /// handled on the path itself is returned to the schedule.
    pub fn process_event(
        &mut self,
        workers: &mut [Worker],
        principal: &mut EventPrincipal,
        trigger: Option<&TriggerResults>,
        actions: &ActionTable,
    ) -> Result<HltState, FrameworkError> {
        self.counters.run += 1;
        for entry in &self.entries {
            let worker = &mut workers[entry.worker];
            let passed = match worker.run_event(principal, trigger) {
                Ok(passed) => passed,
                Err(err) => match actions.find(err.category()) {
                    Action::IgnoreCompletely => {
                        warn!(path = %self.name, module = worker.label(), error = %err, "Ignoring module failure");
                        true
                    }
                    Action::FailModule => {
                        warn!(path = %self.name, module = worker.label(), error = %err, "Module failure treated as rejection");
                        false
                    }
                    Action::FailPath => {
                        warn!(path = %self.name, module = worker.label(), error = %err, "Failing path");
                        self.counters.failed += 1;
                        return Ok(HltState::Fail);
                    }
                    Action::SkipEvent | Action::Rethrow => {
                        self.counters.errors += 1;
                        return Err(err);
                    }
                },
            };
            let accepted = match entry.action {
                FilterAction::Normal => passed,
                FilterAction::Veto => !passed,
                FilterAction::Ignore => true,
            };
            if !accepted {
                self.counters.failed += 1;
                return Ok(HltState::Fail);
            }
        }
        self.counters.passed += 1;
        Ok(HltState::Pass)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bit {})", self.name, self.bit)
    }
}
