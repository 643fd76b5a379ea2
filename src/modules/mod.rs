//! Built-in modules.
//!
//! Registered by [`register_builtins`] so that configurations can use them
//! by name:
//! - `IntProducer`: puts a configured integer into every event
//! - `Prescaler`: accepts one event in `prescaleFactor`
//! - `ProductChecker`: compares a product against an expected value
//! - `EventCounter`: counts events, runs and subruns
//! - `JsonlOutput`: writes occurrences as JSON lines

pub mod event_counter;
pub mod int_producer;
pub mod jsonl_output;
pub mod prescaler;
pub mod product_checker;

pub use event_counter::EventCounter;
pub use int_producer::IntProducer;
pub use jsonl_output::JsonlOutput;
pub use prescaler::Prescaler;
pub use product_checker::ProductChecker;

use crate::core::{ModuleInstance, PluginRegistry};
use crate::domain::{ModuleKind, ModuleThreading};

/// Register every built-in module type
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry
        .register_module(
            "IntProducer",
            ModuleKind::Producer,
            ModuleThreading::Replicated,
            |_, pset, setup| Ok(ModuleInstance::Producer(Box::new(IntProducer::new(pset, setup)?))),
        )
        .register_module(
            "Prescaler",
            ModuleKind::Filter,
            ModuleThreading::Shared,
            |_, pset, setup| Ok(ModuleInstance::Filter(Box::new(Prescaler::new(pset, setup)?))),
        )
        .register_module(
            "ProductChecker",
            ModuleKind::Analyzer,
            ModuleThreading::Shared,
            |_, pset, setup| Ok(ModuleInstance::Analyzer(Box::new(ProductChecker::new(pset, setup)?))),
        )
        .register_module(
            "EventCounter",
            ModuleKind::Analyzer,
            ModuleThreading::Legacy,
            |desc, pset, _| Ok(ModuleInstance::Analyzer(Box::new(EventCounter::new(&desc.label, pset)?))),
        )
        .register_module(
            "JsonlOutput",
            ModuleKind::Output,
            ModuleThreading::Legacy,
            |desc, pset, _| Ok(ModuleInstance::Output(Box::new(JsonlOutput::new(desc, pset)?))),
        );
}
