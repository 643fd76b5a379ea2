//! Workers: one module instance as seen by one schedule.
//!
//! A worker runs its module at most once per event. The outcome is cached
//! until the schedule resets the worker for the next event, so a module
//! placed on several paths is executed only on its first visit.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::trace;

use super::lock;
use super::module::{with_module, DataView, Event, ModuleInstance, SwitchBoundary};
use super::resources::SerialChain;
use super::select::EventSelector;
use crate::domain::{
    BranchType, EventPrincipal, ModuleDescription, ModuleKind, Principal, ProductDescription,
    RunPrincipal, SubRunPrincipal, TriggerResults,
};
use crate::error::{FrameworkError, ModuleError};
use crate::source::FileBlock;

pub type SharedModule = Arc<Mutex<ModuleInstance>>;

/// Cached outcome for the current event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Pass,
    Fail,
    Exception(ModuleError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounters {
    pub visited: u64,
    pub run: u64,
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
}

impl std::ops::AddAssign for WorkerCounters {
    fn add_assign(&mut self, other: Self) {
        self.visited += other.visited;
        self.run += other.run;
        self.passed += other.passed;
        self.failed += other.failed;
        self.errors += other.errors;
    }
}

/// State of an output module's file, queried by the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStatus {
    pub file_open: bool,
    pub wants_switch: bool,
    pub boundary: SwitchBoundary,
    pub limit_reached: bool,
    pub remaining_events: Option<u64>,
}

pub struct Worker {
    description: Arc<ModuleDescription>,
    module: SharedModule,
    produces: Arc<Vec<ProductDescription>>,
    chain: SerialChain,
    /// Receives job, run, subrun and file callbacks
    primary: bool,
    selector: Option<EventSelector>,
    state: WorkerState,
    counters: WorkerCounters,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("label", &self.description.label)
            .field("primary", &self.primary)
            .field("state", &self.state)
            .finish()
    }
}

impl Worker {
    pub fn new(
        description: Arc<ModuleDescription>,
        module: SharedModule,
        produces: Arc<Vec<ProductDescription>>,
        chain: SerialChain,
        primary: bool,
    ) -> Self {
        Self {
            description,
            module,
            produces,
            chain,
            primary,
            selector: None,
            state: WorkerState::Ready,
            counters: WorkerCounters::default(),
        }
    }

    pub fn with_selector(mut self, selector: EventSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn label(&self) -> &str {
        &self.description.label
    }

    pub fn kind(&self) -> ModuleKind {
        self.description.kind
    }

    pub fn description(&self) -> &ModuleDescription {
        &self.description
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn counters(&self) -> WorkerCounters {
        self.counters
    }

    pub fn reset(&mut self) {
        self.state = WorkerState::Ready;
    }

    /// Run the module on an event unless it already ran for this event
    pub fn run_event(
        &mut self,
        principal: &mut EventPrincipal,
        trigger: Option<&TriggerResults>,
    ) -> Result<bool, FrameworkError> {
        self.counters.visited += 1;
        match &self.state {
            WorkerState::Pass => return Ok(true),
            WorkerState::Fail => return Ok(false),
            WorkerState::Exception(e) => {
                return Err(FrameworkError::module(self.description.label.clone(), e.clone()))
            }
            WorkerState::Ready => {}
        }

        if let (Some(selector), Some(results)) = (&self.selector, trigger) {
            if !selector.wants(results) {
                trace!(module = %self.description.label, event = %principal.id(), "Event not selected");
                self.state = WorkerState::Pass;
                return Ok(true);
            }
        }

        self.counters.run += 1;
        let description = &self.description;
        let produces = &self.produces;
        let module = &self.module;
        let outcome = self.chain.run(|| {
            let mut instance = lock(module);
            let mut event = Event::new(
                &*principal,
                BranchType::Event,
                &description.label,
                &description.process_name,
                produces,
            );
            let passed = match &mut *instance {
                ModuleInstance::Producer(m) => {
                    m.produce(&mut event)?;
                    true
                }
                ModuleInstance::Filter(m) => m.filter(&mut event)?,
                ModuleInstance::Analyzer(m) => {
                    m.analyze(&event)?;
                    true
                }
                ModuleInstance::Output(m) => {
                    if m.is_file_open() && !m.limit_reached() {
                        m.write(&event)?;
                    }
                    true
                }
            };
            Ok::<_, ModuleError>((passed, event.into_pending()))
        });

        match outcome {
            Ok((passed, pending)) => {
                for (key, value) in pending {
                    principal.put(key, value)?;
                }
                if passed {
                    self.counters.passed += 1;
                    self.state = WorkerState::Pass;
                } else {
                    self.counters.failed += 1;
                    self.state = WorkerState::Fail;
                }
                Ok(passed)
            }
            Err(e) => {
                self.counters.errors += 1;
                self.state = WorkerState::Exception(e.clone());
                Err(FrameworkError::module(self.description.label.clone(), e))
            }
        }
    }

    fn call<R>(
        &self,
        f: impl FnOnce(&mut ModuleInstance) -> Result<R, ModuleError>,
    ) -> Result<R, FrameworkError> {
        let module = &self.module;
        self.chain
            .run(|| f(&mut lock(module)))
            .map_err(|e| FrameworkError::module(self.description.label.clone(), e))
    }

    fn call_occurrence<I>(
        &self,
        principal: &mut Principal<I>,
        branch_type: BranchType,
        f: impl FnOnce(&mut ModuleInstance, &mut DataView<'_, I>) -> Result<(), ModuleError>,
    ) -> Result<(), FrameworkError>
    where
        I: Copy + PartialEq + fmt::Display,
    {
        if !self.primary {
            return Ok(());
        }
        let description = &self.description;
        let produces = &self.produces;
        let module = &self.module;
        let pending = self
            .chain
            .run(|| {
                let mut instance = lock(module);
                let mut view = DataView::new(
                    &*principal,
                    branch_type,
                    &description.label,
                    &description.process_name,
                    produces,
                );
                f(&mut instance, &mut view)?;
                Ok::<_, ModuleError>(view.into_pending())
            })
            .map_err(|e| FrameworkError::module(description.label.clone(), e))?;
        for (key, value) in pending {
            principal.put(key, value)?;
        }
        Ok(())
    }

    pub fn begin_job(&self) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.begin_job()))
    }

    pub fn end_job(&self) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.end_job()))
    }

    pub fn begin_run(&self, run: &mut RunPrincipal) -> Result<(), FrameworkError> {
        self.call_occurrence(run, BranchType::Run, |m, view| {
            with_module!(m, x => x.begin_run(view))
        })
    }

    pub fn end_run(&self, run: &mut RunPrincipal) -> Result<(), FrameworkError> {
        self.call_occurrence(run, BranchType::Run, |m, view| {
            with_module!(m, x => x.end_run(view))
        })
    }

    pub fn begin_subrun(&self, subrun: &mut SubRunPrincipal) -> Result<(), FrameworkError> {
        self.call_occurrence(subrun, BranchType::SubRun, |m, view| {
            with_module!(m, x => x.begin_subrun(view))
        })
    }

    pub fn end_subrun(&self, subrun: &mut SubRunPrincipal) -> Result<(), FrameworkError> {
        self.call_occurrence(subrun, BranchType::SubRun, |m, view| {
            with_module!(m, x => x.end_subrun(view))
        })
    }

    pub fn respond_to_open_input_file(&self, file: &FileBlock) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.respond_to_open_input_file(file)))
    }

    pub fn respond_to_close_input_file(&self, file: &FileBlock) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.respond_to_close_input_file(file)))
    }

    pub fn respond_to_open_output_files(&self, file: &FileBlock) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.respond_to_open_output_files(file)))
    }

    pub fn respond_to_close_output_files(&self, file: &FileBlock) -> Result<(), FrameworkError> {
        if !self.primary {
            return Ok(());
        }
        self.call(|m| with_module!(m, x => x.respond_to_close_output_files(file)))
    }

    /// Status of the module's output file; None for non-output modules
    pub fn output_status(&self) -> Option<OutputStatus> {
        let instance = lock(&self.module);
        instance.as_output_ref().map(|m| OutputStatus {
            file_open: m.is_file_open(),
            wants_switch: m.requests_file_switch(),
            boundary: m.switch_boundary(),
            limit_reached: m.limit_reached(),
            remaining_events: m.remaining_events(),
        })
    }

    pub fn open_file(&self, file: &FileBlock) -> Result<(), FrameworkError> {
        self.call(|m| match m.as_output() {
            Some(out) if !out.is_file_open() => out.open_file(file),
            _ => Ok(()),
        })
    }

    pub fn close_file(&self) -> Result<(), FrameworkError> {
        self.call(|m| match m.as_output() {
            Some(out) if out.is_file_open() => out.close_file(),
            _ => Ok(()),
        })
    }

    pub fn write_run(&self, run: &RunPrincipal) -> Result<(), FrameworkError> {
        self.call(|m| match m.as_output() {
            Some(out) if out.is_file_open() => out.write_run(run),
            _ => Ok(()),
        })
    }

    pub fn write_subrun(&self, subrun: &SubRunPrincipal) -> Result<(), FrameworkError> {
        self.call(|m| match m.as_output() {
            Some(out) if out.is_file_open() => out.write_subrun(subrun),
            _ => Ok(()),
        })
    }
}
