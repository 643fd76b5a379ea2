//! Domain types shared by sources, modules and the scheduler.
//!
//! This module contains the core data structures:
//! - Ids and items: what an input source announces
//! - Principals: product containers for runs, subruns and events
//! - Products: signatures, input tags and the product registry
//! - Trigger results and status codes

pub mod ids;
pub mod item;
pub mod module_description;
pub mod principal;
pub mod products;
pub mod status;
pub mod trigger;

// Re-export commonly used types
pub use ids::{EventId, RunId, SubRunId};
pub use item::{Item, ItemKind};
pub use module_description::{ModuleDescription, ModuleKind, ModuleThreading};
pub use principal::{EventPrincipal, Principal, ProcessHistory, RunPrincipal, SubRunPrincipal};
pub use products::{BranchType, InputTag, ProductDescription, ProductKey, ProductRegistry};
pub use status::StatusCode;
pub use trigger::{HltState, TriggerResults, TRIGGER_RESULTS_CLASS, TRIGGER_RESULTS_LABEL};
