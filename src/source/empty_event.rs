//! Generator source producing empty events.
//!
//! Parameters: `numberEventsInRun` and `numberEventsInSubRun` (-1 keeps the
//! current run or subrun open forever), `firstRun`, `firstSubRun` and
//! `firstEvent`. The stream never ends on its own; use `maxEvents` or
//! `maxSubRuns` to bound it.

use super::{FileBlock, RawSource};
use crate::config::ParameterSet;
use crate::domain::{
    EventId, EventPrincipal, ItemKind, ProcessHistory, RunId, RunPrincipal, SubRunId,
    SubRunPrincipal,
};
use crate::error::FrameworkError;

pub struct EmptyEvent {
    events_per_run: i64,
    events_per_subrun: i64,
    first_run: u32,
    first_subrun: u32,
    first_event: u32,
    next: ItemKind,
    run: Option<u32>,
    subrun: Option<u32>,
    event: u32,
    events_in_run: i64,
    events_in_subrun: i64,
}

impl EmptyEvent {
    pub fn from_parameters(pset: &ParameterSet) -> Result<Self, FrameworkError> {
        Ok(Self::new(
            pset.get_or("numberEventsInRun", -1)?,
            pset.get_or("numberEventsInSubRun", -1)?,
            pset.get_or("firstRun", 1)?,
            pset.get_or("firstSubRun", 0)?,
            pset.get_or("firstEvent", 1)?,
        ))
    }

    pub fn new(
        events_per_run: i64,
        events_per_subrun: i64,
        first_run: u32,
        first_subrun: u32,
        first_event: u32,
    ) -> Self {
        Self {
            events_per_run,
            events_per_subrun,
            first_run,
            first_subrun,
            first_event,
            next: ItemKind::File,
            run: None,
            subrun: None,
            event: 0,
            events_in_run: 0,
            events_in_subrun: 0,
        }
    }

    fn current_run(&self) -> u32 {
        self.run.unwrap_or(self.first_run)
    }

    fn current_subrun(&self) -> u32 {
        self.subrun.unwrap_or(self.first_subrun)
    }

    fn advance_event(&mut self) -> EventId {
        self.event += 1;
        self.events_in_run += 1;
        self.events_in_subrun += 1;
        self.next = if self.events_per_run > 0 && self.events_in_run >= self.events_per_run {
            ItemKind::Run
        } else if self.events_per_subrun > 0 && self.events_in_subrun >= self.events_per_subrun {
            ItemKind::SubRun
        } else {
            ItemKind::Event
        };
        EventId::new(self.current_run(), self.current_subrun(), self.event)
    }
}

impl RawSource for EmptyEvent {
    fn next_raw(&mut self) -> Result<ItemKind, FrameworkError> {
        Ok(self.next)
    }

    fn read_file(&mut self) -> Result<FileBlock, FrameworkError> {
        self.next = ItemKind::Run;
        Ok(FileBlock::new("EmptyEvent"))
    }

    fn read_run(&mut self) -> Result<RunPrincipal, FrameworkError> {
        let run = match self.run {
            Some(r) => r + 1,
            None => self.first_run,
        };
        self.run = Some(run);
        self.subrun = None;
        self.event = self.first_event.saturating_sub(1);
        self.events_in_run = 0;
        self.next = ItemKind::SubRun;
        Ok(RunPrincipal::new(RunId::new(run), ProcessHistory::default()))
    }

    fn read_subrun(&mut self) -> Result<SubRunPrincipal, FrameworkError> {
        let subrun = match self.subrun {
            Some(s) => s + 1,
            None => self.first_subrun,
        };
        self.subrun = Some(subrun);
        self.events_in_subrun = 0;
        self.next = ItemKind::Event;
        Ok(SubRunPrincipal::new(
            SubRunId::new(self.current_run(), subrun),
            ProcessHistory::default(),
        ))
    }

    fn read_event(&mut self) -> Result<EventPrincipal, FrameworkError> {
        let id = self.advance_event();
        Ok(EventPrincipal::new(id, ProcessHistory::default()))
    }

    fn skip(&mut self, offset: i64) -> Result<(), FrameworkError> {
        if offset < 0 {
            return Err(FrameworkError::logic("EmptyEvent cannot skip backwards"));
        }
        for _ in 0..offset {
            if self.next != ItemKind::Event {
                break;
            }
            self.advance_event();
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), FrameworkError> {
        *self = Self::new(
            self.events_per_run,
            self.events_per_subrun,
            self.first_run,
            self.first_subrun,
            self.first_event,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_runs_and_subruns() {
        let mut src = EmptyEvent::new(4, 2, 5, 0, 1);
        assert_eq!(src.next_raw().unwrap(), ItemKind::File);
        src.read_file().unwrap();
        assert_eq!(src.read_run().unwrap().id(), RunId::new(5));
        assert_eq!(src.read_subrun().unwrap().id(), SubRunId::new(5, 0));
        assert_eq!(src.read_event().unwrap().id(), EventId::new(5, 0, 1));
        assert_eq!(src.next_raw().unwrap(), ItemKind::Event);
        assert_eq!(src.read_event().unwrap().id(), EventId::new(5, 0, 2));
        assert_eq!(src.next_raw().unwrap(), ItemKind::SubRun);
        assert_eq!(src.read_subrun().unwrap().id(), SubRunId::new(5, 1));
        src.read_event().unwrap();
        assert_eq!(src.read_event().unwrap().id(), EventId::new(5, 1, 4));
        assert_eq!(src.next_raw().unwrap(), ItemKind::Run);
        assert_eq!(src.read_run().unwrap().id(), RunId::new(6));
        assert_eq!(src.read_subrun().unwrap().id(), SubRunId::new(6, 0));
        assert_eq!(src.read_event().unwrap().id(), EventId::new(6, 0, 1));
    }

    #[test]
    fn test_parameters_and_rewind() {
        let pset: ParameterSet = serde_yaml::from_str("firstRun: 3\nnumberEventsInSubRun: 1\n").unwrap();
        let mut src = EmptyEvent::from_parameters(&pset).unwrap();
        src.read_file().unwrap();
        assert_eq!(src.read_run().unwrap().id(), RunId::new(3));
        src.rewind().unwrap();
        assert_eq!(src.next_raw().unwrap(), ItemKind::File);
    }
}
