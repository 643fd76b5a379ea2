//! The event processor: owns the source, the schedules and the state
//! machine, and runs the event loop.
//!
//! Construction reads the process configuration, builds every module on an
//! active path, validates the module graph and wires workers into
//! schedules. [`EventProcessor::run_to_completion`] then feeds source items
//! into the state machine until the input is exhausted, the shutdown flag
//! is raised or the outputs are full.
//!
//! Every failure that crosses the loop (errors and panics alike) tears the
//! machine down and comes back as a single [`ProcessingError`] carrying the
//! occurrences that were open and any secondary failures seen during
//! teardown.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::actions::ActionTable;
use super::graph::{ModuleDeclarations, ModuleGraph};
use super::lock;
use super::module::{ModuleSetup, SwitchBoundary};
use super::path::{Path, PathCounters, PathEntry};
use super::path_manager::{ModuleConfig, PathManager, PathSpec};
use super::registry::{ModulePlugin, PluginRegistry};
use super::resources::{SerialChain, SharedResources};
use super::schedule::{EndPath, PathSet, Schedule};
use super::select::EventSelector;
use super::services::{RandomNumberService, ShutdownFlag};
use super::state_machine::{Machine, MachineEvent, MachineOptions, ProcessorActions};
use super::worker::{OutputStatus, SharedModule, Worker, WorkerCounters};
use super::principal_cache::PrincipalCache;
use crate::config::{FileMode, ProcessConfig};
use crate::domain::{
    EventPrincipal, Item, ModuleDescription, ModuleThreading, ProductDescription,
    ProductRegistry, RunId, StatusCode, SubRunId,
};
use crate::error::{ErrorCollector, FrameworkError, OpenOccurrence, ProcessingError};
use crate::source::{FileBlock, InputSource, ProcessingMode, ReadAheadSource};

/// Parameter end-path modules use to select events by trigger path
pub const SELECT_EVENTS_KEY: &str = "SelectEvents";

/// A module built from its configuration, before workers exist
struct Constructed {
    description: Arc<ModuleDescription>,
    shared: SharedModule,
    /// One instance per schedule for replicated trigger-path modules
    replicas: Vec<SharedModule>,
    produces: Arc<Vec<ProductDescription>>,
    declarations: ModuleDeclarations,
    resources: Vec<String>,
    serialize: bool,
    async_events: bool,
    select_events: Vec<String>,
}

impl Constructed {
    fn instance(&self, schedule: usize) -> SharedModule {
        Arc::clone(self.replicas.get(schedule).unwrap_or(&self.shared))
    }

    fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }
}

fn construct_module(
    config: &ModuleConfig,
    plugin: &ModulePlugin,
    process_name: &str,
    copies: usize,
    rng: Option<&Arc<RandomNumberService>>,
) -> Result<Constructed, FrameworkError> {
    let description = Arc::new(ModuleDescription {
        label: config.label.clone(),
        module_type: config.module_type.clone(),
        parameter_set_id: config.pset.id(),
        kind: config.kind,
        threading: config.threading,
        process_name: process_name.to_string(),
    });

    let mut setup = ModuleSetup::new(&config.label, process_name, 0, rng.cloned());
    let shared = Arc::new(Mutex::new(plugin.make(&description, &config.pset, &mut setup)?));

    let mut replicas = Vec::new();
    if config.threading == ModuleThreading::Replicated && copies > 1 {
        replicas.push(Arc::clone(&shared));
        for schedule in 1..copies {
            let mut replica_setup = ModuleSetup::new(&config.label, process_name, schedule, rng.cloned());
            let instance = plugin.make(&description, &config.pset, &mut replica_setup)?;
            replicas.push(Arc::new(Mutex::new(instance)));
        }
    }

    let select_events = if config.kind.is_modifier() {
        Vec::new()
    } else {
        config.pset.get_or(SELECT_EVENTS_KEY, Vec::new())?
    };

    debug!(module = %description, replicas = replicas.len(), "Constructed module");
    Ok(Constructed {
        produces: Arc::new(setup.produced().to_vec()),
        declarations: ModuleDeclarations {
            kind: config.kind,
            produces: setup.produced().to_vec(),
            consumes: setup.consumed().to_vec(),
            consumes_many: setup.consumed_many().to_vec(),
        },
        resources: setup.resources().to_vec(),
        serialize: setup.serialize_requested(),
        async_events: setup.async_requested(),
        description,
        shared,
        replicas,
        select_events,
    })
}

fn construct_modules(
    paths: &PathManager,
    registry: &PluginRegistry,
    process_name: &str,
    num_schedules: usize,
    rng: Option<&Arc<RandomNumberService>>,
) -> Result<BTreeMap<String, Constructed>, FrameworkError> {
    let trigger_labels: BTreeSet<&str> = paths.trigger_labels().into_iter().collect();
    let mut built = BTreeMap::new();
    let mut errors = Vec::new();
    for (label, config) in paths.modules() {
        let copies = if trigger_labels.contains(label.as_str()) {
            num_schedules
        } else {
            1
        };
        let result = registry
            .module(&config.module_type)
            .and_then(|plugin| construct_module(config, plugin, process_name, copies, rng));
        match result {
            Ok(module) => {
                built.insert(label.clone(), module);
            }
            Err(e) => errors.push(format!(
                "Module '{}' of type '{}': {}",
                label, config.module_type, e
            )),
        }
    }
    if !errors.is_empty() {
        return Err(FrameworkError::Collected {
            context: "The following were encountered while constructing modules".to_string(),
            messages: errors,
        });
    }
    Ok(built)
}

/// Workers and paths for `specs`, one worker per label.
///
/// `trigger_names` is given for the end path, whose workers honor
/// `SelectEvents`.
fn build_path_set(
    specs: &[PathSpec],
    modules: &BTreeMap<String, Constructed>,
    chains: &BTreeMap<String, SerialChain>,
    schedule: usize,
    trigger_names: Option<&[String]>,
) -> Result<PathSet, FrameworkError> {
    let mut workers: Vec<Worker> = Vec::new();
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    let mut built = Vec::with_capacity(specs.len());

    for (bit, spec) in specs.iter().enumerate() {
        let mut entries = Vec::with_capacity(spec.entries.len());
        for (label, action) in &spec.entries {
            let worker = match index.get(label.as_str()) {
                Some(&i) => i,
                None => {
                    let module = modules.get(label).ok_or_else(|| {
                        FrameworkError::logic(format!("Module '{}' on path '{}' was not constructed", label, spec.name))
                    })?;
                    let primary = schedule == 0 || module.is_replicated();
                    let mut worker = Worker::new(
                        Arc::clone(&module.description),
                        module.instance(schedule),
                        Arc::clone(&module.produces),
                        chains.get(label).cloned().unwrap_or_default(),
                        primary,
                    );
                    if let Some(names) = trigger_names {
                        if !module.select_events.is_empty() {
                            let selector = EventSelector::new(&module.select_events, names).map_err(|e| {
                                FrameworkError::configuration(format!("Module '{}': {}", label, e))
                            })?;
                            worker = worker.with_selector(selector);
                        }
                    }
                    workers.push(worker);
                    index.insert(label.as_str(), workers.len() - 1);
                    workers.len() - 1
                }
            };
            entries.push(PathEntry { worker, action: *action });
        }
        built.push(Path::new(spec.name.as_str(), bit, entries));
    }
    Ok(PathSet::new(workers, built))
}

/// Counters gathered over all schedules
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerReport {
    pub events: u64,
    pub paths: BTreeMap<String, PathCounters>,
    pub end_path: PathCounters,
    pub modules: BTreeMap<String, WorkerCounters>,
}

/// The processor state the machine acts on
struct ProcessorCore {
    process_name: String,
    source: Box<dyn InputSource>,
    schedules: Vec<Schedule>,
    end_path: Arc<Mutex<EndPath>>,
    actions: ActionTable,
    cache: PrincipalCache,
    file_mode: FileMode,
    rng: Option<Arc<RandomNumberService>>,
    shutdown: ShutdownFlag,
    file: Option<FileBlock>,
    input_open: bool,
    /// Events read but not yet processed, drained one per schedule
    pending: Vec<EventPrincipal>,
    handling_exception: bool,
    cleanup_messages: Vec<String>,
    events_processed: u64,
}

impl ProcessorCore {
    fn current_file(&self) -> Result<FileBlock, FrameworkError> {
        self.file
            .clone()
            .ok_or_else(|| FrameworkError::logic("No input file has been opened"))
    }

    fn output_statuses(&self) -> Vec<OutputStatus> {
        lock(&self.end_path)
            .outputs()
            .filter_map(Worker::output_status)
            .collect()
    }

    /// True when an output asks for a new file at `level` or finer
    fn output_switch_requested(&self, level: SwitchBoundary) -> bool {
        self.output_statuses()
            .iter()
            .any(|s| s.file_open && s.wants_switch && s.boundary <= level)
    }

    fn open_occurrences(&self) -> Vec<OpenOccurrence> {
        let mut open = Vec::new();
        if self.input_open {
            if let Some(file) = &self.file {
                open.push(OpenOccurrence::File(file.file_name.clone()));
            }
        }
        open.extend(self.cache.open_occurrences());
        open
    }

    /// True when the pending events may take every output to its limit
    fn pending_fills_outputs(&self) -> bool {
        let statuses = self.output_statuses();
        !statuses.is_empty()
            && statuses
                .iter()
                .all(|s| s.remaining_events.is_some_and(|n| n <= self.pending.len() as u64))
    }

    /// Run every pending event, one per schedule, in parallel
    fn flush_events(&mut self) -> Result<(), FrameworkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        trace!(events = batch.len(), "Processing event batch");
        let actions = &self.actions;
        // a panic in any schedule resumes here and is normalized by the caller
        let outcomes: Vec<(EventPrincipal, Result<(), FrameworkError>)> = self
            .schedules
            .par_iter_mut()
            .zip(batch)
            .map(|(schedule, mut event)| {
                let result = schedule.process_event(&mut event, actions);
                (event, result)
            })
            .collect();

        let mut first_error = None;
        for (event, result) in outcomes {
            match result {
                Ok(()) => self.events_processed += 1,
                Err(e) if first_error.is_none() => {
                    self.cache.set_event(event);
                    first_error = Some(e);
                }
                Err(e) => warn!(event = %event.id(), error = %e, "Further failure in the same event batch"),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn for_each_path_set<F>(&self, mut f: F) -> Result<(), FrameworkError>
    where
        F: FnMut(&PathSet) -> Result<(), FrameworkError>,
    {
        for schedule in &self.schedules {
            f(schedule.path_set())?;
        }
        f(lock(&self.end_path).path_set())
    }

    fn trigger_report(&self) -> TriggerReport {
        let mut report = TriggerReport {
            events: self.events_processed,
            ..Default::default()
        };
        for schedule in &self.schedules {
            for (name, counters) in schedule.path_counters() {
                *report.paths.entry(name).or_default() += counters;
            }
            for (label, counters) in schedule.worker_counters() {
                *report.modules.entry(label).or_default() += counters;
            }
        }
        let end_path = lock(&self.end_path);
        for path in end_path.path_set().paths() {
            report.end_path += path.counters();
        }
        for worker in end_path.path_set().workers() {
            *report.modules.entry(worker.label().to_string()).or_default() += worker.counters();
        }
        report
    }
}

impl ProcessorActions for ProcessorCore {
    fn read_file(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let file = self.source.read_file()?;
        info!(file = %file.file_name, "Opened input file");
        self.file = Some(file);
        self.input_open = true;
        Ok(())
    }

    fn close_input_file(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        self.source.close_file()?;
        self.input_open = false;
        if let Some(file) = &self.file {
            info!(file = %file.file_name, "Closed input file");
        }
        Ok(())
    }

    fn open_output_files(&mut self) -> Result<(), FrameworkError> {
        let file = self.current_file()?;
        for output in lock(&self.end_path).outputs() {
            output.open_file(&file)?;
        }
        debug!("Opened output files");
        Ok(())
    }

    fn close_output_files(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        for output in lock(&self.end_path).outputs() {
            output.close_file()?;
        }
        debug!("Closed output files");
        Ok(())
    }

    fn respond_to_open_input_file(&mut self) -> Result<(), FrameworkError> {
        let file = self.current_file()?;
        self.for_each_path_set(|set| set.respond_to_open_input_file(&file, &self.actions))
    }

    fn respond_to_close_input_file(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let file = self.current_file()?;
        self.for_each_path_set(|set| set.respond_to_close_input_file(&file, &self.actions))
    }

    fn respond_to_open_output_files(&mut self) -> Result<(), FrameworkError> {
        let file = self.current_file()?;
        self.for_each_path_set(|set| set.respond_to_open_output_files(&file, &self.actions))
    }

    fn respond_to_close_output_files(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let file = self.current_file()?;
        self.for_each_path_set(|set| set.respond_to_close_output_files(&file, &self.actions))
    }

    fn close_some_output_files(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let file = self.current_file()?;
        for output in lock(&self.end_path).outputs() {
            let switching = output.output_status().map_or(false, |s| s.file_open && s.wants_switch);
            if switching {
                output.respond_to_close_output_files(&file)?;
                output.close_file()?;
                info!(module = output.label(), "Closed output file for switch");
            }
        }
        Ok(())
    }

    fn open_some_output_files(&mut self) -> Result<(), FrameworkError> {
        let file = self.current_file()?;
        for output in lock(&self.end_path).outputs() {
            let closed = output.output_status().map_or(false, |s| !s.file_open);
            if closed {
                output.open_file(&file)?;
                output.respond_to_open_output_files(&file)?;
            }
        }
        Ok(())
    }

    fn end_of_loop(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        info!(events = self.events_processed, "End of event loop");
        Ok(())
    }

    fn write_run_cache(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        while let Some(id) = self.cache.lowest_ended_run() {
            self.write_run(id)?;
            self.cache.delete_run(id);
        }
        Ok(())
    }

    fn write_subrun_cache(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()?;
        while let Some(id) = self.cache.lowest_ended_subrun() {
            self.write_subrun(id)?;
            self.cache.delete_subrun(id);
        }
        Ok(())
    }

    fn should_we_close_output(&self) -> bool {
        self.file_mode == FileMode::NoMerge
            || self
                .output_statuses()
                .iter()
                .any(|s| s.wants_switch && s.boundary == SwitchBoundary::InputFile)
    }

    fn do_error_stuff(&mut self) {
        error!(
            "The event processor state machine encountered an unexpected event and went to the error state; \
             will attempt to terminate processing normally. This likely indicates a bug in an input source, corrupted input, or both"
        );
    }

    fn read_and_cache_run(&mut self) -> Result<RunId, FrameworkError> {
        self.flush_events()?;
        let run = self.source.read_run()?;
        self.cache.insert_run(run)
    }

    fn read_and_cache_subrun(&mut self) -> Result<SubRunId, FrameworkError> {
        self.flush_events()?;
        let subrun = self.source.read_subrun()?;
        self.cache.insert_subrun(subrun)
    }

    fn begin_run(&mut self, id: RunId) -> Result<(), FrameworkError> {
        self.flush_events()?;
        if self.cache.run_begun(id) {
            debug!(run = %id, "Run already begun");
            return Ok(());
        }
        let run = self.cache.run_mut(id)?;
        for schedule in &self.schedules {
            schedule.path_set().begin_run(run, &self.actions)?;
        }
        lock(&self.end_path).path_set().begin_run(run, &self.actions)?;
        self.cache.mark_run_begun(id);
        info!(run = %id, "Begin run");
        Ok(())
    }

    fn end_run(&mut self, id: RunId) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let run = self.cache.run_mut(id)?;
        if run.end_time().is_none() {
            run.set_end_time(Utc::now());
        }
        for schedule in &self.schedules {
            schedule.path_set().end_run(run, &self.actions)?;
        }
        lock(&self.end_path).path_set().end_run(run, &self.actions)?;
        self.cache.mark_run_ended(id);
        info!(run = %id, "End run");
        Ok(())
    }

    fn begin_subrun(&mut self, id: SubRunId) -> Result<(), FrameworkError> {
        self.flush_events()?;
        if self.cache.subrun_begun(id) {
            debug!(subrun = %id, "SubRun already begun");
            return Ok(());
        }
        let subrun = self.cache.subrun_mut(id)?;
        for schedule in &self.schedules {
            schedule.path_set().begin_subrun(subrun, &self.actions)?;
        }
        lock(&self.end_path).path_set().begin_subrun(subrun, &self.actions)?;
        self.cache.mark_subrun_begun(id);
        debug!(subrun = %id, "Begin subrun");
        Ok(())
    }

    fn end_subrun(&mut self, id: SubRunId) -> Result<(), FrameworkError> {
        self.flush_events()?;
        let subrun = self.cache.subrun_mut(id)?;
        if subrun.end_time().is_none() {
            subrun.set_end_time(Utc::now());
        }
        for schedule in &self.schedules {
            schedule.path_set().end_subrun(subrun, &self.actions)?;
        }
        lock(&self.end_path).path_set().end_subrun(subrun, &self.actions)?;
        self.cache.mark_subrun_ended(id);
        debug!(subrun = %id, "End subrun");
        Ok(())
    }

    fn write_run(&mut self, id: RunId) -> Result<(), FrameworkError> {
        let run = self
            .cache
            .run(id)
            .ok_or_else(|| FrameworkError::logic(format!("{} is not in the principal cache", id)))?;
        for output in lock(&self.end_path).outputs() {
            output.write_run(run)?;
        }
        debug!(run = %id, "Wrote run");
        Ok(())
    }

    fn delete_run_from_cache(&mut self, id: RunId) -> Result<(), FrameworkError> {
        self.cache.delete_run(id);
        trace!(run = %id, "Deleted run from cache");
        Ok(())
    }

    fn write_subrun(&mut self, id: SubRunId) -> Result<(), FrameworkError> {
        let subrun = self
            .cache
            .subrun(id)
            .ok_or_else(|| FrameworkError::logic(format!("{} is not in the principal cache", id)))?;
        for output in lock(&self.end_path).outputs() {
            output.write_subrun(subrun)?;
        }
        debug!(subrun = %id, "Wrote subrun");
        Ok(())
    }

    fn delete_subrun_from_cache(&mut self, id: SubRunId) -> Result<(), FrameworkError> {
        self.cache.delete_subrun(id);
        trace!(subrun = %id, "Deleted subrun from cache");
        Ok(())
    }

    fn read_event(&mut self) -> Result<(), FrameworkError> {
        let event = self.source.read_event()?;
        self.cache.set_event(event);
        Ok(())
    }

    fn process_event(&mut self) -> Result<(), FrameworkError> {
        let mut event = self
            .cache
            .take_event()
            .ok_or_else(|| FrameworkError::logic("Asked to process an event that was never read"))?;
        if let [schedule] = self.schedules.as_mut_slice() {
            match schedule.process_event(&mut event, &self.actions) {
                Ok(()) => {
                    self.events_processed += 1;
                    Ok(())
                }
                Err(e) => {
                    self.cache.set_event(event);
                    Err(e)
                }
            }
        } else {
            self.pending.push(event);
            if self.pending.len() >= self.schedules.len() || self.pending_fills_outputs() {
                self.flush_events()?;
            }
            Ok(())
        }
    }

    fn finish_pending_events(&mut self) -> Result<(), FrameworkError> {
        self.flush_events()
    }

    fn should_we_stop(&self) -> bool {
        let statuses = self.output_statuses();
        !statuses.is_empty() && statuses.iter().all(|s| s.limit_reached)
    }

    fn set_exception_message_files(&mut self, message: String) {
        self.cleanup_messages.push(message);
    }

    fn set_exception_message_runs(&mut self, message: String) {
        self.cleanup_messages.push(message);
    }

    fn set_exception_message_subruns(&mut self, message: String) {
        self.cleanup_messages.push(message);
    }

    fn already_handling_exception(&self) -> bool {
        self.handling_exception
    }
}

/// Feed source items to the machine until it terminates or `limit`
/// events were seen
fn event_loop(machine: &mut Machine, core: &mut ProcessorCore, limit: i64) -> Result<StatusCode, FrameworkError> {
    let mut status = StatusCode::Success;
    let mut events: i64 = 0;
    while !machine.is_terminated() {
        if core.shutdown.is_requested() {
            info!("Shutdown requested; stopping the event loop");
            status = StatusCode::Signal;
            machine.process_event(MachineEvent::Stop, core)?;
            break;
        }

        let item = core.source.next_item()?;
        trace!(%item, "Next item");
        let boundary = match item {
            Item::Invalid => {
                return Err(FrameworkError::logic(
                    "The input source announced an invalid item to the event processor",
                ))
            }
            Item::Stop => {
                machine.process_event(MachineEvent::Stop, core)?;
                None
            }
            Item::File => {
                machine.process_event(MachineEvent::InputFile, core)?;
                None
            }
            Item::Run(id) => {
                machine.process_event(MachineEvent::Run(id), core)?;
                Some(SwitchBoundary::Run)
            }
            Item::SubRun(id) => {
                machine.process_event(MachineEvent::SubRun(id), core)?;
                Some(SwitchBoundary::SubRun)
            }
            Item::Event => {
                machine.process_event(MachineEvent::Event, core)?;
                events += 1;
                if limit > 0 && events >= limit {
                    debug!(events, "Event count complete, pausing event loop");
                    status = StatusCode::CountComplete;
                    break;
                }
                Some(SwitchBoundary::Event)
            }
        };

        if let Some(level) = boundary {
            if !machine.is_terminated() && core.output_switch_requested(level) {
                debug!(?level, "Output file switch requested");
                machine.process_event(MachineEvent::Pause, core)?;
                machine.process_event(MachineEvent::SwitchOutputFiles, core)?;
            }
        }
    }
    core.flush_events()?;
    Ok(status)
}

/// Drives one process: source, schedules and state machine
pub struct EventProcessor {
    machine: Option<Machine>,
    options: MachineOptions,
    core: ProcessorCore,
    graph: ModuleGraph,
    products: ProductRegistry,
    async_conflicts: Vec<String>,
    want_summary: bool,
}

impl EventProcessor {
    /// Build the processor for a configuration.
    ///
    /// Configuration, module construction and module graph problems are
    /// reported before any item is read.
    pub fn new(config: &ProcessConfig, registry: &PluginRegistry) -> Result<Self, FrameworkError> {
        let scheduler = &config.services.scheduler;
        let options = MachineOptions {
            file_mode: config.file_mode()?,
            handle_empty_runs: scheduler.handle_empty_runs,
            handle_empty_subruns: scheduler.handle_empty_sub_runs,
        };
        let actions = ActionTable::from_config(scheduler)?;
        let mode: ProcessingMode = config.source.processing_mode.parse()?;
        let num_schedules = scheduler.num_schedules.max(1);
        let process_name = config.process_name.clone();
        let rng = config
            .services
            .random_numbers
            .as_ref()
            .map(RandomNumberService::new)
            .transpose()?
            .map(Arc::new);

        let paths = PathManager::new(config, registry)?;
        let modules = construct_modules(&paths, registry, &process_name, num_schedules, rng.as_ref())?;

        let mut products = ProductRegistry::new();
        for module in modules.values() {
            for desc in module.produces.iter() {
                products.register(desc.clone())?;
            }
        }

        let declarations: BTreeMap<String, ModuleDeclarations> = modules
            .iter()
            .map(|(label, m)| (label.clone(), m.declarations.clone()))
            .collect();
        let graph = ModuleGraph::build(&paths, &declarations, &process_name)?;

        // every named resource must exist before legacy chains are built
        let mut resources = SharedResources::new();
        let mut async_conflicts = Vec::new();
        for (label, module) in &modules {
            for name in &module.resources {
                resources.register(name);
            }
            if module.async_events && module.serialize {
                async_conflicts.push(format!(
                    "Module '{}' declares asynchronous event processing but is serialized on [{}]",
                    label,
                    module.resources.join(", ")
                ));
            }
        }
        let chains: BTreeMap<String, SerialChain> = modules
            .iter()
            .map(|(label, m)| {
                let legacy = m.description.threading == ModuleThreading::Legacy;
                (label.clone(), resources.chain_for(&m.resources, legacy))
            })
            .collect();

        let trigger_names = paths.trigger_path_names();
        let end_specs = paths.end_path().map(std::slice::from_ref).unwrap_or(&[]);
        let end_set = build_path_set(end_specs, &modules, &chains, 0, Some(&trigger_names))?;
        let end_path = Arc::new(Mutex::new(EndPath::new(end_set)));

        let mut schedules = Vec::with_capacity(num_schedules);
        for id in 0..num_schedules {
            let set = build_path_set(paths.trigger_paths(), &modules, &chains, id, None)?;
            schedules.push(Schedule::new(id, process_name.as_str(), set, Arc::clone(&end_path)));
        }

        let raw = registry.make_source(&config.source.module_type, &config.source.parameter_set())?;
        let source = ReadAheadSource::new(raw, mode, config.source.max_events, config.source.max_subruns);

        if let Some(path) = &scheduler.data_dependency_graph {
            std::fs::write(path, graph.to_dot())?;
            info!(path = %path.display(), "Wrote module dependency graph");
        }

        products.freeze();
        info!(
            process = %process_name,
            schedules = num_schedules,
            modules = modules.len(),
            trigger_paths = ?trigger_names,
            file_mode = ?options.file_mode,
            "Event processor ready"
        );

        Ok(Self {
            machine: None,
            options,
            core: ProcessorCore {
                process_name,
                source: Box::new(source),
                schedules,
                end_path,
                actions,
                cache: PrincipalCache::new(),
                file_mode: options.file_mode,
                rng,
                shutdown: ShutdownFlag::new(),
                file: None,
                input_open: false,
                pending: Vec::new(),
                handling_exception: false,
                cleanup_messages: Vec::new(),
                events_processed: 0,
            },
            graph,
            products,
            async_conflicts,
            want_summary: scheduler.want_summary,
        })
    }

    /// Replace the source, keeping the read-ahead protocol of the new one
    pub fn with_source(mut self, source: Box<dyn InputSource>) -> Self {
        self.core.source = source;
        self
    }

    /// Flag polled once per loop iteration; clones share state
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.core.shutdown.clone()
    }

    pub fn with_shutdown_flag(mut self, flag: ShutdownFlag) -> Self {
        self.core.shutdown = flag;
        self
    }

    pub fn process_name(&self) -> &str {
        &self.core.process_name
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn product_registry(&self) -> &ProductRegistry {
        &self.products
    }

    pub fn num_schedules(&self) -> usize {
        self.core.schedules.len()
    }

    pub fn events_processed(&self) -> u64 {
        self.core.events_processed
    }

    /// Name of the machine's innermost state, if a machine is alive
    pub fn machine_state(&self) -> Option<&'static str> {
        self.machine.as_ref().map(Machine::state_name)
    }

    pub fn principal_cache(&self) -> &PrincipalCache {
        &self.core.cache
    }

    pub fn trigger_report(&self) -> TriggerReport {
        self.core.trigger_report()
    }

    /// Skip events in the source before processing starts
    pub fn skip_events(&mut self, offset: i64) -> Result<(), FrameworkError> {
        self.core.source.skip_events(offset)
    }

    pub fn begin_job(&mut self) -> Result<(), FrameworkError> {
        if !self.async_conflicts.is_empty() {
            return Err(FrameworkError::configuration(self.async_conflicts.join("\n")));
        }
        self.core.source.begin_job()?;
        for schedule in &self.core.schedules {
            schedule.path_set().begin_job()?;
        }
        lock(&self.core.end_path).path_set().begin_job()?;
        info!(process = %self.core.process_name, "Begin job");
        Ok(())
    }

    /// Call end job everywhere, collecting every failure
    pub fn end_job(&mut self) -> Result<(), FrameworkError> {
        let mut collector = ErrorCollector::new();
        for schedule in &self.core.schedules {
            schedule.path_set().end_job(&mut collector);
        }
        lock(&self.core.end_path).path_set().end_job(&mut collector);
        let source = &mut self.core.source;
        collector.call(|| source.end_job());
        if self.want_summary {
            self.log_summary();
        }
        info!(process = %self.core.process_name, events = self.core.events_processed, "End job");
        collector.finish("The following errors occurred during end job")
    }

    fn log_summary(&self) {
        let report = self.trigger_report();
        info!(events = report.events, "TrigReport ---------- Event summary ----------");
        for (name, c) in &report.paths {
            info!(path = %name, run = c.run, passed = c.passed, failed = c.failed, errors = c.errors, "TrigReport path");
        }
        let c = report.end_path;
        info!(run = c.run, passed = c.passed, failed = c.failed, errors = c.errors, "TrigReport end path");
        for (label, c) in &report.modules {
            info!(
                module = %label,
                visited = c.visited,
                run = c.run,
                passed = c.passed,
                failed = c.failed,
                errors = c.errors,
                "TrigReport module"
            );
        }
    }

    /// Process everything the source delivers
    pub fn run_to_completion(&mut self) -> Result<StatusCode, FrameworkError> {
        let status = self.run_common(-1)?;
        if self.machine.is_some() {
            return Err(FrameworkError::logic(
                "State machine not destroyed on exit from run_to_completion",
            ));
        }
        Ok(status)
    }

    /// Process up to `count` events; the machine survives for the next call
    pub fn run_event_count(&mut self, count: i64) -> Result<StatusCode, FrameworkError> {
        self.run_common(count)
    }

    fn run_common(&mut self, limit: i64) -> Result<StatusCode, FrameworkError> {
        let options = self.options;
        let Self { machine, core, .. } = self;
        let active = machine.get_or_insert_with(|| Machine::new(options));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| event_loop(active, core, limit)));
        let failure = match outcome {
            Ok(Ok(status)) => {
                if active.is_terminated() {
                    let in_error = active.was_in_error();
                    *machine = None;
                    if in_error {
                        return Err(FrameworkError::BadState);
                    }
                }
                return Ok(status);
            }
            Ok(Err(err)) => ProcessingError::from_error(err),
            Err(payload) => ProcessingError::from_panic(payload),
        };

        error!(kind = failure.kind.label(), error = %failure.message, "Processing failed");
        let open = core.open_occurrences();
        self.terminate_abnormally();
        let cleanup = std::mem::take(&mut self.core.cleanup_messages);
        Err(FrameworkError::Processing(
            failure.with_open_occurrences(open).with_cleanup_messages(cleanup),
        ))
    }

    fn terminate_abnormally(&mut self) {
        let core = &mut self.core;
        core.handling_exception = true;
        if let Some(rng) = &core.rng {
            if let Err(e) = rng.save_snapshot() {
                warn!(error = %e, "Failed to save random number engine states");
            }
        }
        core.pending.clear();
        if let Some(mut machine) = self.machine.take() {
            let teardown = panic::catch_unwind(AssertUnwindSafe(|| machine.terminate(core)));
            if let Err(payload) = teardown {
                let p = ProcessingError::from_panic(payload);
                core.cleanup_messages
                    .push(format!("A panic occurred while tearing down after the primary failure: {}", p.message));
            }
        }
        core.cache.clear();
        core.input_open = false;
        core.handling_exception = false;
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        if let Some(mut machine) = self.machine.take() {
            if !machine.is_terminated() {
                debug!("Event processor dropped with a live state machine; stopping it");
                if let Err(e) = machine.process_event(MachineEvent::Stop, &mut self.core) {
                    warn!(error = %e, "Failed to stop the state machine");
                }
            }
        }
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("process_name", &self.core.process_name)
            .field("schedules", &self.core.schedules.len())
            .field("machine", &self.machine_state())
            .field("events_processed", &self.core.events_processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::{Analyzer, Event, Module, ModuleInstance};
    use crate::domain::ModuleKind;
    use crate::error::ModuleError;

    struct Quiet;

    impl Module for Quiet {}

    impl Analyzer for Quiet {
        fn analyze(&mut self, _event: &Event<'_>) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    fn processor(yaml: &str) -> EventProcessor {
        let config = ProcessConfig::from_yaml_str(yaml).unwrap();
        EventProcessor::new(&config, &PluginRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_runs_empty_events_to_completion() {
        let mut p = processor(
            r#"
process_name: TEST
source: { module_type: EmptyEvent, maxEvents: 5, numberEventsInSubRun: 2 }
physics:
  producers:
    ints: { module_type: IntProducer, value: 3 }
  p1: [ints]
"#,
        );
        p.begin_job().unwrap();
        assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
        p.end_job().unwrap();
        assert_eq!(p.events_processed(), 5);
        assert!(p.machine_state().is_none());

        let report = p.trigger_report();
        assert_eq!(report.paths["p1"].passed, 5);
        assert_eq!(report.modules["ints"].run, 5);
        assert_eq!(p.product_registry().len(), 1);
        assert!(p.product_registry().is_frozen());
    }

    #[test]
    fn test_event_count_keeps_machine() {
        let mut p = processor("source: { module_type: EmptyEvent, maxEvents: 10 }\n");
        assert_eq!(p.run_event_count(3).unwrap(), StatusCode::CountComplete);
        assert_eq!(p.events_processed(), 3);
        assert!(p.machine_state().is_some());
        assert_eq!(p.run_to_completion().unwrap(), StatusCode::Success);
        assert_eq!(p.events_processed(), 10);
    }

    #[test]
    fn test_shutdown_flag_stops_with_signal() {
        let mut p = processor("source: { module_type: EmptyEvent }\n");
        p.shutdown_flag().request();
        assert_eq!(p.run_to_completion().unwrap(), StatusCode::Signal);
        assert_eq!(p.events_processed(), 0);
    }

    #[test]
    fn test_async_serialize_conflict_reported_at_begin_job() {
        let mut registry = PluginRegistry::with_builtins();
        registry.register_module(
            "AsyncSerial",
            ModuleKind::Analyzer,
            ModuleThreading::Shared,
            |_, _, setup| {
                setup.serialize(&["DB"]).async_events();
                Ok(ModuleInstance::Analyzer(Box::new(Quiet)))
            },
        );
        let config = ProcessConfig::from_yaml_str(
            "physics:\n  analyzers:\n    a: { module_type: AsyncSerial }\n  e1: [a]\n",
        )
        .unwrap();
        let mut p = EventProcessor::new(&config, &registry).unwrap();
        let err = p.begin_job().unwrap_err();
        assert!(err.to_string().contains("Module 'a' declares asynchronous event processing"));
    }
}
