//! Count events, subruns and runs seen by a path.

use tracing::info;

use crate::config::ParameterSet;
use crate::core::{Analyzer, Event, Module, Run, SubRun};
use crate::error::{FrameworkError, ModuleError};

/// Counts occurrences and, when `expected`, `expectedSubRuns` or
/// `expectedRuns` are configured, fails at end of job on a mismatch.
#[derive(Debug, Default)]
pub struct EventCounter {
    label: String,
    events: u64,
    subruns: u64,
    runs: u64,
    expected_events: Option<u64>,
    expected_subruns: Option<u64>,
    expected_runs: Option<u64>,
}

impl EventCounter {
    pub fn new(label: &str, pset: &ParameterSet) -> Result<Self, FrameworkError> {
        Ok(Self {
            label: label.to_string(),
            expected_events: pset.get_opt("expected")?,
            expected_subruns: pset.get_opt("expectedSubRuns")?,
            expected_runs: pset.get_opt("expectedRuns")?,
            ..Default::default()
        })
    }

    pub fn events(&self) -> u64 {
        self.events
    }
}

fn compare(what: &str, expected: Option<u64>, seen: u64) -> Result<(), ModuleError> {
    match expected {
        Some(n) if n != seen => Err(ModuleError::new(
            "EventCountMismatch",
            format!("Expected {} {} but saw {}", n, what, seen),
        )),
        _ => Ok(()),
    }
}

impl Module for EventCounter {
    fn begin_run(&mut self, _run: &mut Run<'_>) -> Result<(), ModuleError> {
        self.runs += 1;
        Ok(())
    }

    fn begin_subrun(&mut self, _subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        self.subruns += 1;
        Ok(())
    }

    fn end_job(&mut self) -> Result<(), ModuleError> {
        info!(
            module = %self.label,
            events = self.events,
            subruns = self.subruns,
            runs = self.runs,
            "Occurrence counts"
        );
        compare("events", self.expected_events, self.events)?;
        compare("subruns", self.expected_subruns, self.subruns)?;
        compare("runs", self.expected_runs, self.runs)
    }
}

impl Analyzer for EventCounter {
    fn analyze(&mut self, _event: &Event<'_>) -> Result<(), ModuleError> {
        self.events += 1;
        Ok(())
    }
}
