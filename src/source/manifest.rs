//! Source replaying a described set of files.
//!
//! Each manifest file lists its runs, their subruns and the event numbers
//! of every subrun, optionally with run and subrun products. Manifests come
//! either inline (`files:`) or from YAML/JSON documents (`fileNames:`).
//! The same run or subrun may appear in several files; those fragments are
//! merged by the principal cache according to the file mode.
//!
//! ```yaml
//! source:
//!   module_type: ManifestInput
//!   files:
//!     - name: a.data
//!       process_history: [SIM]
//!       runs:
//!         - run: 1
//!           products: [{ class: int, label: lumi, value: 10 }]
//!           subruns:
//!             - { subrun: 0, events: [1, 2, 3] }
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{FileBlock, RawSource};
use crate::config::ParameterSet;
use crate::domain::{
    EventId, EventPrincipal, ItemKind, Principal, ProcessHistory, ProductKey, RunId, RunPrincipal,
    SubRunId, SubRunPrincipal,
};
use crate::error::FrameworkError;

/// Process name used for products when a manifest has no history
const DEFAULT_SOURCE_PROCESS: &str = "SOURCE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,

    #[serde(default)]
    pub process_history: Vec<String>,

    #[serde(default)]
    pub runs: Vec<ManifestRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRun {
    pub run: u32,

    #[serde(default)]
    pub products: Vec<ManifestProduct>,

    #[serde(default)]
    pub subruns: Vec<ManifestSubRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSubRun {
    pub subrun: u32,

    #[serde(default)]
    pub products: Vec<ManifestProduct>,

    #[serde(default)]
    pub events: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestProduct {
    pub class: String,
    pub label: String,
    #[serde(default)]
    pub instance: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    File { file: usize },
    Run { file: usize, run: usize },
    SubRun { file: usize, run: usize, subrun: usize },
    Event { file: usize, run: usize, subrun: usize, event: usize },
}

impl Entry {
    fn kind(&self) -> ItemKind {
        match self {
            Self::File { .. } => ItemKind::File,
            Self::Run { .. } => ItemKind::Run,
            Self::SubRun { .. } => ItemKind::SubRun,
            Self::Event { .. } => ItemKind::Event,
        }
    }

    fn file(&self) -> usize {
        match *self {
            Self::File { file } | Self::Run { file, .. } | Self::SubRun { file, .. } | Self::Event { file, .. } => file,
        }
    }

    fn run(&self) -> Option<usize> {
        match *self {
            Self::File { .. } => None,
            Self::Run { run, .. } | Self::SubRun { run, .. } | Self::Event { run, .. } => Some(run),
        }
    }

    fn subrun(&self) -> Option<usize> {
        match *self {
            Self::SubRun { subrun, .. } | Self::Event { subrun, .. } => Some(subrun),
            _ => None,
        }
    }
}

pub struct ManifestSource {
    files: Vec<ManifestFile>,
    entries: Vec<Entry>,
    cursor: usize,
    /// Event entries passed over by `skip`; a rewind replays them
    skipped: BTreeSet<usize>,
}

impl ManifestSource {
    pub fn new(files: Vec<ManifestFile>) -> Self {
        let mut entries = Vec::new();
        for (f, file) in files.iter().enumerate() {
            entries.push(Entry::File { file: f });
            for (r, run) in file.runs.iter().enumerate() {
                entries.push(Entry::Run { file: f, run: r });
                for (s, subrun) in run.subruns.iter().enumerate() {
                    entries.push(Entry::SubRun { file: f, run: r, subrun: s });
                    for e in 0..subrun.events.len() {
                        entries.push(Entry::Event { file: f, run: r, subrun: s, event: e });
                    }
                }
            }
        }
        Self {
            files,
            entries,
            cursor: 0,
            skipped: BTreeSet::new(),
        }
    }

    /// Build from `files` (inline) and/or `fileNames` (documents on disk)
    pub fn from_parameters(pset: &ParameterSet) -> Result<Self, FrameworkError> {
        let mut files: Vec<ManifestFile> = pset.get_or("files", Vec::new())?;
        let names: Vec<PathBuf> = pset.get_or("fileNames", Vec::new())?;
        for path in names {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                FrameworkError::Source(format!("Failed to open manifest {}: {}", path.display(), e))
            })?;
            let file: ManifestFile = serde_yaml::from_str(&text).map_err(|e| {
                FrameworkError::Source(format!("Failed to parse manifest {}: {}", path.display(), e))
            })?;
            files.push(file);
        }
        if files.is_empty() {
            return Err(FrameworkError::configuration(
                "ManifestInput needs at least one entry in 'files' or 'fileNames'",
            ));
        }
        Ok(Self::new(files))
    }

    fn history(&self, file: usize) -> ProcessHistory {
        ProcessHistory::new(self.files[file].process_history.clone())
    }

    fn source_process(&self, file: usize) -> String {
        self.files[file]
            .process_history
            .last()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SOURCE_PROCESS.to_string())
    }

    fn fill<I>(&self, principal: &mut Principal<I>, file: usize, products: &[ManifestProduct]) -> Result<(), FrameworkError>
    where
        I: Copy + PartialEq + std::fmt::Display,
    {
        let process = self.source_process(file);
        for p in products {
            principal.put(
                ProductKey::new(&p.class, &p.label, &p.instance, &process),
                p.value.clone(),
            )?;
        }
        Ok(())
    }

    fn run_principal(&self, file: usize, run: usize, with_products: bool) -> Result<RunPrincipal, FrameworkError> {
        let spec = &self.files[file].runs[run];
        let mut principal = RunPrincipal::new(RunId::new(spec.run), self.history(file));
        if with_products {
            self.fill(&mut principal, file, &spec.products)?;
        }
        Ok(principal)
    }

    fn subrun_principal(&self, file: usize, run: usize, subrun: usize, with_products: bool) -> Result<SubRunPrincipal, FrameworkError> {
        let run_spec = &self.files[file].runs[run];
        let spec = &run_spec.subruns[subrun];
        let mut principal =
            SubRunPrincipal::new(SubRunId::new(run_spec.run, spec.subrun), self.history(file));
        if with_products {
            self.fill(&mut principal, file, &spec.products)?;
        }
        Ok(principal)
    }

    fn event_id(&self, entry: Entry) -> Option<EventId> {
        match entry {
            Entry::Event { file, run, subrun, event } => {
                let run_spec = &self.files[file].runs[run];
                let sub = &run_spec.subruns[subrun];
                Some(EventId::new(run_spec.run, sub.subrun, sub.events[event]))
            }
            _ => None,
        }
    }

    /// Index of the next entry that was not skipped
    fn position(&self) -> Option<usize> {
        (self.cursor..self.entries.len()).find(|i| !self.skipped.contains(i))
    }

    fn current(&self) -> Option<Entry> {
        self.position().map(|i| self.entries[i])
    }

    /// Move past the current entry
    fn advance(&mut self) {
        self.cursor = self.position().map_or(self.entries.len(), |i| i + 1);
    }

    fn take(&mut self, kind: ItemKind) -> Result<Entry, FrameworkError> {
        match self.current() {
            Some(entry) if entry.kind() == kind => {
                self.advance();
                Ok(entry)
            }
            other => Err(FrameworkError::Source(format!(
                "Manifest expected a {:?} entry but found {:?}",
                kind,
                other.map(|e| e.kind())
            ))),
        }
    }
}

impl RawSource for ManifestSource {
    fn next_raw(&mut self) -> Result<ItemKind, FrameworkError> {
        Ok(self.current().map(|e| e.kind()).unwrap_or(ItemKind::Stop))
    }

    fn read_file(&mut self) -> Result<FileBlock, FrameworkError> {
        let entry = self.take(ItemKind::File)?;
        let name = self.files[entry.file()].name.clone();
        info!(file = %name, "Opened input file");
        Ok(FileBlock::new(name))
    }

    fn close_file(&mut self) -> Result<(), FrameworkError> {
        debug!("Closed input file");
        Ok(())
    }

    fn read_run(&mut self) -> Result<RunPrincipal, FrameworkError> {
        match self.current() {
            Some(Entry::Run { file, run }) => {
                self.advance();
                self.run_principal(file, run, true)
            }
            // stream continues a run without announcing it
            Some(entry) => match entry.run() {
                Some(run) => self.run_principal(entry.file(), run, false),
                None => Err(FrameworkError::Source("Manifest has no run to read".into())),
            },
            None => Err(FrameworkError::Source("Manifest is exhausted".into())),
        }
    }

    fn read_subrun(&mut self) -> Result<SubRunPrincipal, FrameworkError> {
        match self.current() {
            Some(Entry::SubRun { file, run, subrun }) => {
                self.advance();
                self.subrun_principal(file, run, subrun, true)
            }
            Some(entry) => match (entry.run(), entry.subrun()) {
                (Some(run), Some(subrun)) => self.subrun_principal(entry.file(), run, subrun, false),
                _ => Err(FrameworkError::Source("Manifest has no subrun to read".into())),
            },
            None => Err(FrameworkError::Source("Manifest is exhausted".into())),
        }
    }

    fn read_event(&mut self) -> Result<EventPrincipal, FrameworkError> {
        let entry = self.take(ItemKind::Event)?;
        let id = self
            .event_id(entry)
            .ok_or_else(|| FrameworkError::logic("Event entry without an event id"))?;
        Ok(EventPrincipal::new(id, self.history(entry.file())))
    }

    fn read_event_by_id(&mut self, id: EventId) -> Result<Option<EventPrincipal>, FrameworkError> {
        let found = self
            .entries
            .iter()
            .copied()
            .find(|e| self.event_id(*e) == Some(id));
        Ok(found.map(|e| EventPrincipal::new(id, self.history(e.file()))))
    }

    fn skip(&mut self, offset: i64) -> Result<(), FrameworkError> {
        if offset < 0 {
            return Err(FrameworkError::logic("ManifestInput cannot skip backwards"));
        }
        let mut remaining = offset;
        let mut pos = self.cursor;
        while remaining > 0 && pos < self.entries.len() {
            if self.entries[pos].kind() == ItemKind::Event && self.skipped.insert(pos) {
                remaining -= 1;
            }
            pos += 1;
        }
        debug!(skipped = offset - remaining, "Skipped events");
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), FrameworkError> {
        self.cursor = 0;
        self.skipped.clear();
        Ok(())
    }
}
