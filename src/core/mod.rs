//! Core scheduling and orchestration.
//!
//! This module contains:
//! - StateMachine: file / run / subrun / event transitions
//! - EventProcessor: the event loop and error normalization
//! - Schedule, Path, Worker: per-event module execution
//! - PathManager, ModuleGraph: configuration and dependency validation
//! - PrincipalCache, SharedResources, ActionTable, services

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod actions;
pub mod event_processor;
pub mod graph;
pub mod module;
pub mod path;
pub mod path_manager;
pub mod principal_cache;
pub mod registry;
pub mod resources;
pub mod schedule;
pub mod select;
pub mod services;
pub mod state_machine;
pub mod worker;

// Re-export commonly used types
pub use actions::{Action, ActionTable};
pub use event_processor::{EventProcessor, TriggerReport};
pub use graph::{EdgeKind, ModuleGraph};
pub use module::{
    Analyzer, DataView, Event, Filter, Module, ModuleInstance, ModuleSetup, OutputModule, Producer,
    Run, SubRun, SwitchBoundary,
};
pub use path::{FilterAction, PathCounters};
pub use path_manager::PathManager;
pub use principal_cache::PrincipalCache;
pub use registry::PluginRegistry;
pub use services::{RandomEngine, RandomNumberService, ShutdownFlag};
pub use state_machine::{Machine, MachineEvent, MachineOptions, ProcessorActions};
pub use worker::WorkerCounters;

/// Lock a mutex, recovering the data if another holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
