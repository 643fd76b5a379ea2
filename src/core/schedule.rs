//! Schedules: the trigger paths of one event stream plus the shared end path.
//!
//! Each schedule owns its trigger-path workers and records one
//! [`TriggerResults`] per event. All schedules feed the single end path,
//! which is locked while an event runs through it.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::actions::{Action, ActionTable};
use super::lock;
use super::path::{Path, PathCounters};
use super::worker::{Worker, WorkerCounters};
use crate::domain::{
    EventPrincipal, HltState, ProductKey, RunPrincipal, SubRunPrincipal, TriggerResults,
    TRIGGER_RESULTS_CLASS, TRIGGER_RESULTS_LABEL,
};
use crate::error::FrameworkError;
use crate::source::FileBlock;

/// Apply `f` to each worker, honoring only IgnoreCompletely for failures
fn for_each_worker<F>(workers: &[Worker], actions: &ActionTable, mut f: F) -> Result<(), FrameworkError>
where
    F: FnMut(&Worker) -> Result<(), FrameworkError>,
{
    for worker in workers {
        if let Err(err) = f(worker) {
            match actions.find_for_occurrence(err.category()) {
                Action::IgnoreCompletely => {
                    warn!(module = worker.label(), error = %err, "Ignoring failure outside event processing");
                }
                _ => return Err(err),
            }
        }
    }
    Ok(())
}

/// Workers and paths sharing one worker arena
#[derive(Debug)]
pub struct PathSet {
    workers: Vec<Worker>,
    paths: Vec<Path>,
}

impl PathSet {
    pub fn new(workers: Vec<Worker>, paths: Vec<Path>) -> Self {
        Self { workers, paths }
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn path_names(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn begin_job(&self) -> Result<(), FrameworkError> {
        self.workers.iter().try_for_each(Worker::begin_job)
    }

    pub fn end_job(&self, collector: &mut crate::error::ErrorCollector) {
        for worker in &self.workers {
            collector.call(|| worker.end_job());
        }
    }

    pub fn begin_run(&self, run: &mut RunPrincipal, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.begin_run(run))
    }

    pub fn end_run(&self, run: &mut RunPrincipal, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.end_run(run))
    }

    pub fn begin_subrun(&self, subrun: &mut SubRunPrincipal, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.begin_subrun(subrun))
    }

    pub fn end_subrun(&self, subrun: &mut SubRunPrincipal, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.end_subrun(subrun))
    }

    pub fn respond_to_open_input_file(&self, file: &FileBlock, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.respond_to_open_input_file(file))
    }

    pub fn respond_to_close_input_file(&self, file: &FileBlock, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.respond_to_close_input_file(file))
    }

    pub fn respond_to_open_output_files(&self, file: &FileBlock, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.respond_to_open_output_files(file))
    }

    pub fn respond_to_close_output_files(&self, file: &FileBlock, actions: &ActionTable) -> Result<(), FrameworkError> {
        for_each_worker(&self.workers, actions, |w| w.respond_to_close_output_files(file))
    }

    fn reset(&mut self) {
        for worker in &mut self.workers {
            worker.reset();
        }
    }
}

/// The single end path, shared by all schedules
#[derive(Debug)]
pub struct EndPath {
    set: PathSet,
}

impl EndPath {
    pub fn new(set: PathSet) -> Self {
        Self { set }
    }

    pub fn path_set(&self) -> &PathSet {
        &self.set
    }

    /// Output workers, in configuration order
    pub fn outputs(&self) -> impl Iterator<Item = &Worker> {
        self.set
            .workers
            .iter()
            .filter(|w| w.output_status().is_some())
    }

    pub fn process_event(
        &mut self,
        principal: &mut EventPrincipal,
        results: &TriggerResults,
        actions: &ActionTable,
    ) -> Result<(), FrameworkError> {
        self.set.reset();
        let PathSet { workers, paths } = &mut self.set;
        for path in paths.iter_mut() {
            if let Err(err) = path.process_event(workers, principal, Some(results), actions) {
                if actions.find(err.category()) == Action::SkipEvent {
                    warn!(event = %principal.id(), error = %err, "Skipping rest of end path");
                    return Ok(());
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Trigger paths of one schedule
#[derive(Debug)]
pub struct Schedule {
    id: usize,
    process_name: String,
    set: PathSet,
    end_path: Arc<Mutex<EndPath>>,
}

impl Schedule {
    pub fn new(id: usize, process_name: impl Into<String>, set: PathSet, end_path: Arc<Mutex<EndPath>>) -> Self {
        Self {
            id,
            process_name: process_name.into(),
            set,
            end_path,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn path_set(&self) -> &PathSet {
        &self.set
    }

    pub fn path_counters(&self) -> Vec<(String, PathCounters)> {
        self.set
            .paths
            .iter()
            .map(|p| (p.name().to_string(), p.counters()))
            .collect()
    }

    pub fn worker_counters(&self) -> Vec<(String, WorkerCounters)> {
        self.set
            .workers
            .iter()
            .map(|w| (w.label().to_string(), w.counters()))
            .collect()
    }

    /// Run every trigger path, store the trigger results, then run the end path.
    ///
    /// A SkipEvent failure stops the event after the trigger results are
    /// stored; the end path is not run for it.
    pub fn process_event(&mut self, principal: &mut EventPrincipal, actions: &ActionTable) -> Result<(), FrameworkError> {
        self.set.reset();
        let mut results = TriggerResults::new(self.set.path_names());
        let mut skipped = false;

        let PathSet { workers, paths } = &mut self.set;
        for path in paths.iter_mut() {
            match path.process_event(workers, principal, None, actions) {
                Ok(state) => results.set(path.bit(), state),
                Err(err) => {
                    results.set(path.bit(), HltState::Exception);
                    if actions.find(err.category()) != Action::SkipEvent {
                        return Err(err);
                    }
                    warn!(schedule = self.id, event = %principal.id(), path = path.name(), error = %err, "Skipping event");
                    skipped = true;
                    break;
                }
            }
        }

        let key = ProductKey::new(TRIGGER_RESULTS_CLASS, TRIGGER_RESULTS_LABEL, "", self.process_name.as_str());
        principal.put(key, serde_json::to_value(&results)?)?;
        debug!(schedule = self.id, event = %principal.id(), accept = results.accept(), "Trigger paths done");

        if skipped {
            return Ok(());
        }
        lock(&self.end_path).process_event(principal, &results, actions)
    }
}
