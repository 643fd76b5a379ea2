//! Items announced by an input source.

use std::fmt;

use super::ids::{RunId, SubRunId};

/// The next unit of work an input source has to offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    /// Nothing has been looked at yet
    Invalid,
    File,
    Run(RunId),
    SubRun(SubRunId),
    Event,
    Stop,
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Invalid => ItemKind::Invalid,
            Self::File => ItemKind::File,
            Self::Run(_) => ItemKind::Run,
            Self::SubRun(_) => ItemKind::SubRun,
            Self::Event => ItemKind::Event,
            Self::Stop => ItemKind::Stop,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(id) => write!(f, "{}", id),
            Self::SubRun(id) => write!(f, "{}", id),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Payload-free tag of an [`Item`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Invalid,
    File,
    Run,
    SubRun,
    Event,
    Stop,
}
