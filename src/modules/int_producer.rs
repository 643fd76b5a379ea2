//! Producer of a configured integer.

use tracing::trace;

use crate::config::ParameterSet;
use crate::core::{Event, Module, ModuleSetup, Producer, RandomEngine, Run, SubRun};
use crate::domain::BranchType;
use crate::error::{FrameworkError, ModuleError};

/// Puts `value` into every event as an `int` product.
///
/// With `randomSeed` set, also puts a uniform `float` under instance
/// `flat`, drawn from an engine of the random-number service. With
/// `branchType: SubRun` or `Run`, the value is put at the end of every
/// subrun or run instead of into events.
pub struct IntProducer {
    value: i64,
    branch_type: BranchType,
    engine: Option<RandomEngine>,
    /// Only the schedule-0 copy puts run and subrun products
    puts_summaries: bool,
}

impl IntProducer {
    pub fn new(pset: &ParameterSet, setup: &mut ModuleSetup) -> Result<Self, FrameworkError> {
        let value = pset.get::<i64>("value")?;
        let branch_type = match pset.get_or("branchType", "Event".to_string())?.as_str() {
            "Event" => BranchType::Event,
            "SubRun" => BranchType::SubRun,
            "Run" => BranchType::Run,
            other => {
                return Err(FrameworkError::configuration(format!(
                    "Illegal branchType '{}'; legal values are 'Event', 'SubRun' and 'Run'",
                    other
                )))
            }
        };
        setup.produces_in(branch_type, "int", "");

        let engine = match pset.get_opt::<u64>("randomSeed")? {
            Some(seed) => {
                setup.produces("float", "flat");
                Some(setup.create_engine(seed)?)
            }
            None => None,
        };

        Ok(Self {
            value,
            branch_type,
            engine,
            puts_summaries: setup.schedule() == 0,
        })
    }
}

impl Module for IntProducer {
    fn end_subrun(&mut self, subrun: &mut SubRun<'_>) -> Result<(), ModuleError> {
        if self.puts_summaries && self.branch_type == BranchType::SubRun {
            subrun.put("int", "", &self.value)?;
        }
        Ok(())
    }

    fn end_run(&mut self, run: &mut Run<'_>) -> Result<(), ModuleError> {
        if self.puts_summaries && self.branch_type == BranchType::Run {
            run.put("int", "", &self.value)?;
        }
        Ok(())
    }
}

impl Producer for IntProducer {
    fn produce(&mut self, event: &mut Event<'_>) -> Result<(), ModuleError> {
        if self.branch_type == BranchType::Event {
            event.put("int", "", &self.value)?;
        }
        if let Some(engine) = &self.engine {
            let flat = engine.flat();
            trace!(engine = engine.label(), flat, "Drew random number");
            event.put("float", "flat", &flat)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, EventPrincipal, ProcessHistory};

    fn pset(yaml: &str) -> ParameterSet {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_puts_configured_value() {
        let mut setup = ModuleSetup::new("ints", "TEST", 0, None);
        let mut producer = IntProducer::new(&pset("value: 42\n"), &mut setup).unwrap();
        let principal = EventPrincipal::new(EventId::new(1, 0, 1), ProcessHistory::default());
        let mut event = Event::new(&principal, BranchType::Event, "ints", "TEST", setup.produced());
        producer.produce(&mut event).unwrap();

        let pending = event.into_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, serde_json::json!(42));
    }

    #[test]
    fn test_requires_value_and_legal_branch_type() {
        let mut setup = ModuleSetup::new("ints", "TEST", 0, None);
        assert!(IntProducer::new(&pset("{}"), &mut setup).is_err());
        let err = IntProducer::new(&pset("value: 1\nbranchType: Job\n"), &mut setup)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Illegal branchType 'Job'"));
    }

    #[test]
    fn test_random_seed_needs_service() {
        let mut setup = ModuleSetup::new("ints", "TEST", 0, None);
        let err = IntProducer::new(&pset("value: 1\nrandomSeed: 7\n"), &mut setup)
            .err()
            .unwrap();
        assert!(matches!(err, FrameworkError::Configuration(_)));
    }
}
