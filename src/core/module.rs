//! Module interfaces.
//!
//! Every module implements [`Module`] for its job, run, subrun and file
//! callbacks, plus exactly one of [`Producer`], [`Filter`], [`Analyzer`] or
//! [`OutputModule`]. Modules see occurrences through a [`DataView`]; products
//! a module puts are committed to the principal only after its callback
//! returns successfully.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::services::{RandomEngine, RandomNumberService};
use crate::domain::{
    BranchType, EventId, InputTag, ModuleKind, Principal, ProductDescription, ProductKey, RunId,
    RunPrincipal, SubRunId, SubRunPrincipal, TriggerResults, TRIGGER_RESULTS_CLASS,
    TRIGGER_RESULTS_LABEL,
};
use crate::error::{FrameworkError, ModuleError};
use crate::source::FileBlock;

/// Read access to one occurrence plus a buffer of products to put
pub struct DataView<'a, I> {
    principal: &'a Principal<I>,
    branch_type: BranchType,
    module_label: &'a str,
    process_name: &'a str,
    declared: &'a [ProductDescription],
    pending: Vec<(ProductKey, Value)>,
}

pub type Event<'a> = DataView<'a, EventId>;
pub type Run<'a> = DataView<'a, RunId>;
pub type SubRun<'a> = DataView<'a, SubRunId>;

impl<'a, I> DataView<'a, I>
where
    I: Copy + PartialEq + fmt::Display,
{
    pub(crate) fn new(
        principal: &'a Principal<I>,
        branch_type: BranchType,
        module_label: &'a str,
        process_name: &'a str,
        declared: &'a [ProductDescription],
    ) -> Self {
        Self {
            principal,
            branch_type,
            module_label,
            process_name,
            declared,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> I {
        self.principal.id()
    }

    pub fn principal(&self) -> &Principal<I> {
        self.principal
    }

    pub fn process_name(&self) -> &str {
        self.process_name
    }

    /// Queue a product; it must have been declared with `produces`
    pub fn put<T: Serialize>(&mut self, class: &str, instance: &str, value: &T) -> Result<(), ModuleError> {
        let key = ProductKey::new(class, self.module_label, instance, self.process_name);
        let declared = self
            .declared
            .iter()
            .any(|d| d.branch_type == self.branch_type && d.key == key);
        if !declared {
            return Err(ModuleError::new(
                "ProductPutFailure",
                format!(
                    "Module '{}' puts undeclared {} product {}",
                    self.module_label, self.branch_type, key
                ),
            ));
        }
        if self.pending.iter().any(|(k, _)| *k == key) {
            return Err(ModuleError::new(
                "ProductPutFailure",
                format!("Product {} was put twice", key),
            ));
        }
        self.pending.push((key, serde_json::to_value(value)?));
        Ok(())
    }

    pub fn get_value(&self, class: &str, tag: &InputTag) -> Option<&Value> {
        self.principal.find(class, tag).map(|(_, v)| v)
    }

    pub fn get<T: DeserializeOwned>(&self, class: &str, tag: &InputTag) -> Result<T, ModuleError> {
        let value = self.get_value(class, tag).ok_or_else(|| {
            ModuleError::new(
                "ProductNotFound",
                format!("No {} product with tag {} in {}", class, tag, self.id()),
            )
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn get_many(&self, class: &str) -> Vec<(&ProductKey, &Value)> {
        self.principal.find_many(class)
    }

    pub(crate) fn into_pending(self) -> Vec<(ProductKey, Value)> {
        self.pending
    }
}

impl<'a> DataView<'a, EventId> {
    /// Path results of the current process, available to end-path modules
    pub fn trigger_results(&self) -> Option<TriggerResults> {
        let tag = InputTag::new(TRIGGER_RESULTS_LABEL).with_process(self.process_name);
        self.get(TRIGGER_RESULTS_CLASS, &tag).ok()
    }
}

/// Callbacks common to every module kind; all default to doing nothing
pub trait Module: Send {
    fn begin_job(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn end_job(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn begin_run(&mut self, _run: &mut Run<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn end_run(&mut self, _run: &mut Run<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn begin_subrun(&mut self, _subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn end_subrun(&mut self, _subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn respond_to_open_input_file(&mut self, _file: &FileBlock) -> Result<(), ModuleError> {
        Ok(())
    }

    fn respond_to_close_input_file(&mut self, _file: &FileBlock) -> Result<(), ModuleError> {
        Ok(())
    }

    fn respond_to_open_output_files(&mut self, _file: &FileBlock) -> Result<(), ModuleError> {
        Ok(())
    }

    fn respond_to_close_output_files(&mut self, _file: &FileBlock) -> Result<(), ModuleError> {
        Ok(())
    }
}

pub trait Producer: Module {
    fn produce(&mut self, event: &mut Event<'_>) -> Result<(), ModuleError>;
}

pub trait Filter: Module {
    /// Return false to reject the event on this path
    fn filter(&mut self, event: &mut Event<'_>) -> Result<bool, ModuleError>;
}

pub trait Analyzer: Module {
    fn analyze(&mut self, event: &Event<'_>) -> Result<(), ModuleError>;
}

/// Granularity at which an output may switch to a new file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SwitchBoundary {
    Event,
    SubRun,
    Run,
    InputFile,
}

impl std::str::FromStr for SwitchBoundary {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Event" => Ok(Self::Event),
            "SubRun" => Ok(Self::SubRun),
            "Run" => Ok(Self::Run),
            "InputFile" => Ok(Self::InputFile),
            other => Err(FrameworkError::configuration(format!(
                "Illegal fileSwitchBoundary '{}'; legal values are 'Event', 'SubRun', 'Run' and 'InputFile'",
                other
            ))),
        }
    }
}

pub trait OutputModule: Module {
    fn open_file(&mut self, file: &FileBlock) -> Result<(), ModuleError>;

    fn close_file(&mut self) -> Result<(), ModuleError>;

    fn is_file_open(&self) -> bool;

    fn write(&mut self, event: &Event<'_>) -> Result<(), ModuleError>;

    fn write_subrun(&mut self, subrun: &SubRunPrincipal) -> Result<(), ModuleError>;

    fn write_run(&mut self, run: &RunPrincipal) -> Result<(), ModuleError>;

    /// True once the current file is full and should be switched
    fn requests_file_switch(&self) -> bool {
        false
    }

    fn switch_boundary(&self) -> SwitchBoundary {
        SwitchBoundary::InputFile
    }

    /// Events still accepted before the module's limit; None when unlimited
    fn remaining_events(&self) -> Option<u64> {
        None
    }

    /// True once the module wants no more events
    fn limit_reached(&self) -> bool {
        self.remaining_events() == Some(0)
    }
}

/// A constructed module of any kind
pub enum ModuleInstance {
    Producer(Box<dyn Producer>),
    Filter(Box<dyn Filter>),
    Analyzer(Box<dyn Analyzer>),
    Output(Box<dyn OutputModule>),
}

/// Run `$body` with `$m` bound to the instance as `&mut dyn Module`-like
/// receiver, whatever its kind
macro_rules! with_module {
    ($instance:expr, $m:ident => $body:expr) => {
        match $instance {
            $crate::core::module::ModuleInstance::Producer($m) => $body,
            $crate::core::module::ModuleInstance::Filter($m) => $body,
            $crate::core::module::ModuleInstance::Analyzer($m) => $body,
            $crate::core::module::ModuleInstance::Output($m) => $body,
        }
    };
}
pub(crate) use with_module;

impl ModuleInstance {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Producer(_) => ModuleKind::Producer,
            Self::Filter(_) => ModuleKind::Filter,
            Self::Analyzer(_) => ModuleKind::Analyzer,
            Self::Output(_) => ModuleKind::Output,
        }
    }

    pub fn as_output(&mut self) -> Option<&mut dyn OutputModule> {
        match self {
            Self::Output(m) => Some(m.as_mut()),
            _ => None,
        }
    }

    pub fn as_output_ref(&self) -> Option<&dyn OutputModule> {
        match self {
            Self::Output(m) => Some(m.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleInstance({})", self.kind())
    }
}

/// A data dependency declared at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumesInfo {
    pub branch_type: BranchType,
    pub class: String,
    pub tag: InputTag,
}

/// Declarations a module makes while it is constructed
#[derive(Debug)]
pub struct ModuleSetup {
    label: String,
    process_name: String,
    schedule: usize,
    produces: Vec<ProductDescription>,
    consumes: Vec<ConsumesInfo>,
    consumes_many: Vec<String>,
    resources: Vec<String>,
    serialize_requested: bool,
    async_requested: bool,
    rng: Option<Arc<RandomNumberService>>,
}

impl ModuleSetup {
    pub fn new(
        label: impl Into<String>,
        process_name: impl Into<String>,
        schedule: usize,
        rng: Option<Arc<RandomNumberService>>,
    ) -> Self {
        Self {
            label: label.into(),
            process_name: process_name.into(),
            schedule,
            produces: Vec::new(),
            consumes: Vec::new(),
            consumes_many: Vec::new(),
            resources: Vec::new(),
            serialize_requested: false,
            async_requested: false,
            rng,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn schedule(&self) -> usize {
        self.schedule
    }

    /// Declare an event product
    pub fn produces(&mut self, class: &str, instance: &str) -> &mut Self {
        self.produces_in(BranchType::Event, class, instance)
    }

    pub fn produces_in(&mut self, branch_type: BranchType, class: &str, instance: &str) -> &mut Self {
        let key = ProductKey::new(class, self.label.as_str(), instance, self.process_name.as_str());
        if !self.produces.iter().any(|d| d.branch_type == branch_type && d.key == key) {
            self.produces.push(ProductDescription { branch_type, key });
        }
        self
    }

    /// Declare an event product this module reads
    pub fn consumes(&mut self, class: &str, tag: InputTag) -> &mut Self {
        self.consumes_in(BranchType::Event, class, tag)
    }

    pub fn consumes_in(&mut self, branch_type: BranchType, class: &str, tag: InputTag) -> &mut Self {
        self.consumes.push(ConsumesInfo {
            branch_type,
            class: class.to_string(),
            tag,
        });
        self
    }

    /// Declare that every event product of `class` is read
    pub fn consumes_many(&mut self, class: &str) -> &mut Self {
        self.consumes_many.push(class.to_string());
        self
    }

    /// Serialize against the named resources; none means the module's own label
    pub fn serialize(&mut self, resources: &[&str]) -> &mut Self {
        self.serialize_requested = true;
        if resources.is_empty() {
            self.resources.push(self.label.clone());
        } else {
            self.resources.extend(resources.iter().map(|r| r.to_string()));
        }
        self.resources.sort();
        self.resources.dedup();
        self
    }

    /// Declare that events may be processed concurrently
    pub fn async_events(&mut self) -> &mut Self {
        self.async_requested = true;
        self
    }

    pub fn create_engine(&mut self, seed: u64) -> Result<RandomEngine, FrameworkError> {
        let service = self.rng.as_ref().ok_or_else(|| {
            FrameworkError::configuration(format!(
                "Module '{}' requests a random number engine but the RandomNumberGenerator service is not configured",
                self.label
            ))
        })?;
        let engine_label = if self.schedule == 0 {
            self.label.clone()
        } else {
            format!("{}#{}", self.label, self.schedule)
        };
        service.create_engine(&engine_label, seed)
    }

    pub fn produced(&self) -> &[ProductDescription] {
        &self.produces
    }

    pub fn consumed(&self) -> &[ConsumesInfo] {
        &self.consumes
    }

    pub fn consumed_many(&self) -> &[String] {
        &self.consumes_many
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn serialize_requested(&self) -> bool {
        self.serialize_requested
    }

    pub fn async_requested(&self) -> bool {
        self.async_requested
    }
}
