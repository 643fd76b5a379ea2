//! Occurrence identifiers.
//!
//! Ordering follows containment: runs order by number, subruns by
//! (run, subrun), events by (run, subrun, event).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub run: u32,
}

impl RunId {
    pub fn new(run: u32) -> Self {
        Self { run }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run {}", self.run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubRunId {
    pub run: u32,
    pub subrun: u32,
}

impl SubRunId {
    pub fn new(run: u32, subrun: u32) -> Self {
        Self { run, subrun }
    }

    pub fn run_id(&self) -> RunId {
        RunId::new(self.run)
    }
}

impl fmt::Display for SubRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubRun {}:{}", self.run, self.subrun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub run: u32,
    pub subrun: u32,
    pub event: u32,
}

impl EventId {
    pub fn new(run: u32, subrun: u32, event: u32) -> Self {
        Self { run, subrun, event }
    }

    pub fn run_id(&self) -> RunId {
        RunId::new(self.run)
    }

    pub fn subrun_id(&self) -> SubRunId {
        SubRunId::new(self.run, self.subrun)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event {}:{}:{}", self.run, self.subrun, self.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_containment() {
        assert!(SubRunId::new(1, 9) < SubRunId::new(2, 0));
        assert!(EventId::new(1, 2, 100) < EventId::new(1, 3, 1));
        assert_eq!(EventId::new(4, 5, 6).subrun_id(), SubRunId::new(4, 5));
    }
}
