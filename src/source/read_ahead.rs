//! Item negotiation on top of a raw source.
//!
//! `ReadAheadSource` decides the next item from the previous item, the raw
//! stream, the processing mode and the configured limits:
//!
//! - the event limit stops immediately;
//! - the subrun limit stops only at a boundary. A subrun that is streaming
//!   events may keep delivering them, and the first non-event becomes Stop;
//! - after a File the next item is a Run, after a Run (in subrun capable
//!   modes) the next item is a SubRun, whatever the raw stream says;
//! - entries the processing mode excludes are read and dropped.
//!
//! Run and subrun principals are read while looking ahead so that their ids
//! travel with the announced item.

use chrono::Local;
use tracing::{debug, info};

use super::{FileBlock, InputSource, ProcessingMode, RawSource};
use crate::domain::{EventId, EventPrincipal, Item, ItemKind, RunPrincipal, SubRunPrincipal};
use crate::error::FrameworkError;

/// English ordinal suffix for record counts
pub fn ordinal_suffix(n: u64) -> &'static str {
    if (11..=13).contains(&(n % 100)) {
        return "th";
    }
    match n % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

pub struct ReadAheadSource {
    raw: Box<dyn RawSource>,
    mode: ProcessingMode,

    /// Events still allowed (-1 = unlimited)
    remaining_events: i64,

    /// Subruns still allowed (-1 = unlimited)
    remaining_subruns: i64,

    read_count: u64,
    done_read_ahead: bool,
    state: Item,
    run_principal: Option<RunPrincipal>,
    subrun_principal: Option<SubRunPrincipal>,
}

impl ReadAheadSource {
    pub fn new(
        raw: Box<dyn RawSource>,
        mode: ProcessingMode,
        max_events: i64,
        max_subruns: i64,
    ) -> Self {
        Self {
            raw,
            mode,
            remaining_events: max_events,
            remaining_subruns: max_subruns,
            read_count: 0,
            done_read_ahead: false,
            state: Item::Invalid,
            run_principal: None,
            subrun_principal: None,
        }
    }

    pub fn processing_mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn remaining_events(&self) -> i64 {
        self.remaining_events
    }

    pub fn remaining_subruns(&self) -> i64 {
        self.remaining_subruns
    }

    /// Number of events read so far
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    fn event_limit_reached(&self) -> bool {
        self.remaining_events == 0
    }

    fn subrun_limit_reached(&self) -> bool {
        self.remaining_subruns == 0
    }

    fn limit_reached(&self) -> bool {
        self.event_limit_reached() || self.subrun_limit_reached()
    }

    /// Raw next entry with mode-excluded entries dropped
    fn next_allowed_raw(&mut self) -> Result<ItemKind, FrameworkError> {
        loop {
            let kind = self.raw.next_raw()?;
            match kind {
                ItemKind::Event if self.mode != ProcessingMode::RunsSubRunsAndEvents => {
                    let dropped = self.raw.read_event()?;
                    debug!(event = %dropped.id(), mode = %self.mode, "Skipping event excluded by processing mode");
                }
                ItemKind::SubRun if self.mode == ProcessingMode::Runs => {
                    let dropped = self.raw.read_subrun()?;
                    debug!(subrun = %dropped.id(), mode = %self.mode, "Skipping subrun excluded by processing mode");
                }
                ItemKind::Invalid => {
                    return Err(FrameworkError::logic(
                        "Input source reported an invalid next entry",
                    ))
                }
                other => return Ok(other),
            }
        }
    }

    fn expect_state(&self, wanted: ItemKind, operation: &str) -> Result<(), FrameworkError> {
        if !self.done_read_ahead || self.state.kind() != wanted {
            return Err(FrameworkError::logic(format!(
                "{} called while the announced item is {}",
                operation, self.state
            )));
        }
        Ok(())
    }

    fn issue_report(&self, id: EventId) {
        info!(
            "Begin processing the {}{} record. Run {}, SubRun {}, Event {} at {}",
            self.read_count,
            ordinal_suffix(self.read_count),
            id.run,
            id.subrun,
            id.event,
            Local::now().format("%d-%b-%Y %H:%M:%S %Z")
        );
    }

    fn count_event(&mut self, id: EventId) {
        if self.remaining_events > 0 {
            self.remaining_events -= 1;
        }
        self.read_count += 1;
        self.issue_report(id);
    }
}

impl InputSource for ReadAheadSource {
    fn next_item(&mut self) -> Result<Item, FrameworkError> {
        if self.done_read_ahead {
            return Ok(self.state);
        }
        self.done_read_ahead = true;
        let old = self.state.kind();

        let next = if self.event_limit_reached() {
            Item::Stop
        } else if self.subrun_limit_reached() {
            if matches!(old, ItemKind::Invalid | ItemKind::File | ItemKind::Run)
                || self.mode != ProcessingMode::RunsSubRunsAndEvents
            {
                Item::Stop
            } else if self.next_allowed_raw()? == ItemKind::Event {
                Item::Event
            } else {
                Item::Stop
            }
        } else {
            let raw = self.next_allowed_raw()?;
            if raw == ItemKind::Stop {
                Item::Stop
            } else if raw == ItemKind::File || old == ItemKind::Invalid {
                Item::File
            } else if raw == ItemKind::Run || old == ItemKind::File {
                let run = self.raw.read_run()?;
                let id = run.id();
                self.run_principal = Some(run);
                Item::Run(id)
            } else if raw == ItemKind::SubRun || old == ItemKind::Run {
                let subrun = self.raw.read_subrun()?;
                let id = subrun.id();
                self.subrun_principal = Some(subrun);
                Item::SubRun(id)
            } else {
                Item::Event
            }
        };

        if next == Item::Stop {
            self.run_principal = None;
            self.subrun_principal = None;
        }
        self.state = next;
        Ok(next)
    }

    fn read_file(&mut self) -> Result<FileBlock, FrameworkError> {
        self.expect_state(ItemKind::File, "read_file")?;
        if self.limit_reached() {
            return Err(FrameworkError::logic("read_file called after a limit was reached"));
        }
        self.done_read_ahead = false;
        self.raw.read_file()
    }

    fn close_file(&mut self) -> Result<(), FrameworkError> {
        self.raw.close_file()
    }

    fn read_run(&mut self) -> Result<RunPrincipal, FrameworkError> {
        self.expect_state(ItemKind::Run, "read_run")?;
        if self.limit_reached() {
            return Err(FrameworkError::logic("read_run called after a limit was reached"));
        }
        self.done_read_ahead = false;
        self.run_principal
            .take()
            .ok_or_else(|| FrameworkError::logic("No run principal was read ahead"))
    }

    fn read_subrun(&mut self) -> Result<SubRunPrincipal, FrameworkError> {
        self.expect_state(ItemKind::SubRun, "read_subrun")?;
        if self.limit_reached() {
            return Err(FrameworkError::logic("read_subrun called after a limit was reached"));
        }
        self.done_read_ahead = false;
        if self.remaining_subruns > 0 {
            self.remaining_subruns -= 1;
        }
        self.subrun_principal
            .take()
            .ok_or_else(|| FrameworkError::logic("No subrun principal was read ahead"))
    }

    fn read_event(&mut self) -> Result<EventPrincipal, FrameworkError> {
        self.expect_state(ItemKind::Event, "read_event")?;
        if self.event_limit_reached() {
            return Err(FrameworkError::logic("read_event called after the event limit was reached"));
        }
        self.done_read_ahead = false;
        let event = self.raw.read_event()?;
        self.count_event(event.id());
        Ok(event)
    }

    fn read_event_by_id(&mut self, id: EventId) -> Result<Option<EventPrincipal>, FrameworkError> {
        if self.limit_reached() {
            return Ok(None);
        }
        let event = self.raw.read_event_by_id(id)?;
        if let Some(ev) = &event {
            self.count_event(ev.id());
        }
        Ok(event)
    }

    fn skip_events(&mut self, offset: i64) -> Result<(), FrameworkError> {
        self.raw.skip(offset)
    }

    fn rewind(&mut self) -> Result<(), FrameworkError> {
        self.raw.rewind()?;
        self.done_read_ahead = false;
        self.state = Item::Invalid;
        self.run_principal = None;
        self.subrun_principal = None;
        Ok(())
    }

    fn begin_job(&mut self) -> Result<(), FrameworkError> {
        self.raw.begin_job()
    }

    fn end_job(&mut self) -> Result<(), FrameworkError> {
        self.raw.end_job()
    }
}
