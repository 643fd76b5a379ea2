//! Accept one event in N.

use crate::config::ParameterSet;
use crate::core::{Event, Filter, Module, ModuleSetup};
use crate::error::{FrameworkError, ModuleError};

/// Passes the events whose running count satisfies
/// `count % prescaleFactor == prescaleOffset`, counting from one.
#[derive(Debug)]
pub struct Prescaler {
    count: u64,
    factor: u64,
    offset: u64,
}

impl Prescaler {
    pub fn new(pset: &ParameterSet, setup: &mut ModuleSetup) -> Result<Self, FrameworkError> {
        let factor = pset.get::<u64>("prescaleFactor")?;
        let offset = pset.get_or::<u64>("prescaleOffset", 0)?;
        if factor == 0 {
            return Err(FrameworkError::configuration(format!(
                "Prescaler '{}' needs a prescaleFactor greater than zero",
                setup.label()
            )));
        }
        if offset >= factor {
            return Err(FrameworkError::configuration(format!(
                "Prescaler '{}' has prescaleOffset {} which can never match prescaleFactor {}",
                setup.label(),
                offset,
                factor
            )));
        }
        // Increment, modulo and compare must happen as one step.
        setup.serialize(&[]);
        Ok(Self {
            count: 0,
            factor,
            offset,
        })
    }
}

impl Module for Prescaler {}

impl Filter for Prescaler {
    fn filter(&mut self, _event: &mut Event<'_>) -> Result<bool, ModuleError> {
        self.count += 1;
        Ok(self.count % self.factor == self.offset)
    }
}
