//! Input sources.
//!
//! A concrete source implements [`RawSource`]: it reports what comes next
//! in its stream and reads it on request. The processor never talks to a
//! raw source directly; it goes through [`ReadAheadSource`], which enforces
//! the processing mode, the event and subrun limits, and the rule that
//! asking for the next item is idempotent until that item is read.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{EventId, EventPrincipal, Item, ItemKind, RunPrincipal, SubRunPrincipal};
use crate::error::FrameworkError;

pub mod empty_event;
pub mod manifest;
pub mod read_ahead;

pub use empty_event::EmptyEvent;
pub use manifest::{ManifestFile, ManifestSource};
pub use read_ahead::{ordinal_suffix, ReadAheadSource};

/// Which occurrence levels a source delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingMode {
    Runs,
    RunsAndSubRuns,
    RunsSubRunsAndEvents,
}

impl FromStr for ProcessingMode {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Runs" => Ok(Self::Runs),
            "RunsAndSubRuns" => Ok(Self::RunsAndSubRuns),
            "RunsSubRunsAndEvents" => Ok(Self::RunsSubRunsAndEvents),
            other => Err(FrameworkError::configuration(format!(
                "The 'processingMode' parameter for sources has an illegal value '{}'; legal values are 'RunsSubRunsAndEvents', 'RunsAndSubRuns' or 'Runs'",
                other
            ))),
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Handle on an opened input file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub file_name: String,
}

impl FileBlock {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

pub(crate) fn random_access_unsupported(operation: &str) -> FrameworkError {
    FrameworkError::logic(format!(
        "{}: random access is not implemented for this type of input source",
        operation
    ))
}

/// A concrete stream of files, runs, subruns and events.
///
/// `next_raw` reports the kind of the next entry without consuming it.
/// `read_run` may be called right after a file even when the stream
/// continues with a subrun or event; the source must then supply the run
/// those entries belong to.
pub trait RawSource: Send {
    fn next_raw(&mut self) -> Result<ItemKind, FrameworkError>;

    fn read_file(&mut self) -> Result<FileBlock, FrameworkError>;

    fn close_file(&mut self) -> Result<(), FrameworkError> {
        Ok(())
    }

    fn read_run(&mut self) -> Result<RunPrincipal, FrameworkError>;

    fn read_subrun(&mut self) -> Result<SubRunPrincipal, FrameworkError>;

    fn read_event(&mut self) -> Result<EventPrincipal, FrameworkError>;

    fn read_event_by_id(&mut self, _id: EventId) -> Result<Option<EventPrincipal>, FrameworkError> {
        Err(random_access_unsupported("read_event_by_id"))
    }

    fn skip(&mut self, _offset: i64) -> Result<(), FrameworkError> {
        Err(random_access_unsupported("skip"))
    }

    fn rewind(&mut self) -> Result<(), FrameworkError> {
        Err(FrameworkError::logic(
            "rewind: rewind is not implemented for this type of input source",
        ))
    }

    fn begin_job(&mut self) -> Result<(), FrameworkError> {
        Ok(())
    }

    fn end_job(&mut self) -> Result<(), FrameworkError> {
        Ok(())
    }
}

/// The source interface consumed by the event processor.
///
/// `next_item` is idempotent until the matching `read_*` call consumes the
/// announced item.
pub trait InputSource: Send {
    fn next_item(&mut self) -> Result<Item, FrameworkError>;

    fn read_file(&mut self) -> Result<FileBlock, FrameworkError>;

    fn close_file(&mut self) -> Result<(), FrameworkError>;

    fn read_run(&mut self) -> Result<RunPrincipal, FrameworkError>;

    fn read_subrun(&mut self) -> Result<SubRunPrincipal, FrameworkError>;

    fn read_event(&mut self) -> Result<EventPrincipal, FrameworkError>;

    fn read_event_by_id(&mut self, id: EventId) -> Result<Option<EventPrincipal>, FrameworkError>;

    fn skip_events(&mut self, offset: i64) -> Result<(), FrameworkError>;

    fn rewind(&mut self) -> Result<(), FrameworkError>;

    fn begin_job(&mut self) -> Result<(), FrameworkError>;

    fn end_job(&mut self) -> Result<(), FrameworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_mode_parsing() {
        assert_eq!("Runs".parse::<ProcessingMode>().unwrap(), ProcessingMode::Runs);
        assert_eq!(
            "RunsAndSubRuns".parse::<ProcessingMode>().unwrap(),
            ProcessingMode::RunsAndSubRuns
        );
        let err = "Events".parse::<ProcessingMode>().unwrap_err();
        assert!(err.to_string().contains("illegal value 'Events'"));
    }
}
