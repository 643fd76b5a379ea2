//! Output module writing one JSON record per line.
//!
//! Every output file starts with a header record carrying a fresh GUID and
//! ends with a trailer record holding the counts written to it. Events,
//! subruns and runs are written with all of their products keyed by
//! branch name.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ParameterSet;
use crate::core::{Event, Module, OutputModule, SwitchBoundary};
use crate::domain::{ModuleDescription, Principal, RunPrincipal, SubRunPrincipal};
use crate::error::{FrameworkError, ModuleError};
use crate::source::FileBlock;

/// Placeholder in `fileName` replaced by the output file sequence number
pub const FILE_NUMBER_PLACEHOLDER: &str = "%#";

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record<'a> {
    Header {
        guid: String,
        process: &'a str,
        module: &'a str,
        input_file: &'a str,
        opened_at: DateTime<Utc>,
    },
    Event {
        run: u32,
        subrun: u32,
        event: u32,
        products: BTreeMap<String, &'a Value>,
    },
    Subrun {
        run: u32,
        subrun: u32,
        begin_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        products: BTreeMap<String, &'a Value>,
    },
    Run {
        run: u32,
        begin_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        products: BTreeMap<String, &'a Value>,
    },
    Trailer {
        events: u64,
        subruns: u64,
        runs: u64,
        closed_at: DateTime<Utc>,
    },
}

fn products_of<I>(principal: &Principal<I>) -> BTreeMap<String, &Value>
where
    I: Copy + PartialEq + std::fmt::Display,
{
    principal
        .products()
        .map(|(key, value)| (key.branch_name(), value))
        .collect()
}

fn write_error(path: &PathBuf, e: impl std::fmt::Display) -> ModuleError {
    ModuleError::new(
        "FileWriteError",
        format!("Failed to write {}: {}", path.display(), e),
    )
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    events: u64,
    subruns: u64,
    runs: u64,
}

/// Writes occurrences to `fileName` as JSON lines
#[derive(Debug)]
pub struct JsonlOutput {
    label: String,
    process_name: String,
    file_name: String,
    max_events: Option<u64>,
    max_events_per_file: Option<u64>,
    boundary: SwitchBoundary,
    file: Option<OpenFile>,
    files_opened: u32,
    events_written: u64,
    written_paths: Vec<PathBuf>,
}

impl JsonlOutput {
    pub fn new(description: &ModuleDescription, pset: &ParameterSet) -> Result<Self, FrameworkError> {
        let file_name = pset.get::<String>("fileName")?;
        let limit = |key: &str| -> Result<Option<u64>, FrameworkError> {
            let n = pset.get_or::<i64>(key, -1)?;
            Ok(u64::try_from(n).ok())
        };
        let max_events = limit("maxEvents")?;
        let max_events_per_file = limit("maxEventsPerFile")?;
        if max_events_per_file == Some(0) {
            return Err(FrameworkError::configuration(format!(
                "Output '{}' has maxEventsPerFile 0; use a positive value or -1",
                description.label
            )));
        }

        let default_boundary = if max_events_per_file.is_some() {
            "Event"
        } else {
            "InputFile"
        };
        let boundary: SwitchBoundary = pset
            .get_or("fileSwitchBoundary", default_boundary.to_string())?
            .parse()?;
        if max_events_per_file.is_some() && !file_name.contains(FILE_NUMBER_PLACEHOLDER) {
            return Err(FrameworkError::configuration(format!(
                "Output '{}' switches files after maxEventsPerFile events, so fileName '{}' must contain '{}'",
                description.label, file_name, FILE_NUMBER_PLACEHOLDER
            )));
        }

        Ok(Self {
            label: description.label.clone(),
            process_name: description.process_name.clone(),
            file_name,
            max_events,
            max_events_per_file,
            boundary,
            file: None,
            files_opened: 0,
            events_written: 0,
            written_paths: Vec::new(),
        })
    }

    /// Paths of every file opened so far, in opening order
    pub fn written_paths(&self) -> &[PathBuf] {
        &self.written_paths
    }

    fn next_path(&self) -> PathBuf {
        PathBuf::from(
            self.file_name
                .replace(FILE_NUMBER_PLACEHOLDER, &self.files_opened.to_string()),
        )
    }

    fn emit(&mut self, record: &Record<'_>) -> Result<(), ModuleError> {
        let file = self.file.as_mut().ok_or_else(|| {
            ModuleError::new(
                "LogicError",
                format!("Output '{}' asked to write with no open file", self.label),
            )
        })?;
        serde_json::to_writer(&mut file.writer, record)?;
        file.writer
            .write_all(b"\n")
            .map_err(|e| write_error(&file.path, e))
    }
}

impl Module for JsonlOutput {
    fn end_job(&mut self) -> Result<(), ModuleError> {
        if self.file.is_some() {
            self.close_file()?;
        }
        info!(
            module = %self.label,
            events = self.events_written,
            files = self.files_opened,
            "Output finished"
        );
        Ok(())
    }
}

impl OutputModule for JsonlOutput {
    fn open_file(&mut self, input: &FileBlock) -> Result<(), ModuleError> {
        if self.file.is_some() {
            self.close_file()?;
        }
        self.files_opened += 1;
        let path = self.next_path();
        // A name without the placeholder is reused; later files are appended.
        let reused = self.written_paths.contains(&path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_error(&path, e))?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .append(reused)
            .truncate(!reused)
            .open(&path)
            .map_err(|e| write_error(&path, e))?;
        debug!(module = %self.label, path = %path.display(), "Opened output file");
        if !reused {
            self.written_paths.push(path.clone());
        }
        self.file = Some(OpenFile {
            path,
            writer: BufWriter::new(handle),
            events: 0,
            subruns: 0,
            runs: 0,
        });

        let guid = Uuid::new_v4().to_string();
        let process = self.process_name.clone();
        let module = self.label.clone();
        self.emit(&Record::Header {
            guid,
            process: &process,
            module: &module,
            input_file: &input.file_name,
            opened_at: Utc::now(),
        })
    }

    fn close_file(&mut self) -> Result<(), ModuleError> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let trailer = Record::Trailer {
            events: file.events,
            subruns: file.subruns,
            runs: file.runs,
            closed_at: Utc::now(),
        };
        self.emit(&trailer)?;
        if let Some(mut file) = self.file.take() {
            file.writer.flush().map_err(|e| write_error(&file.path, e))?;
            debug!(
                module = %self.label,
                path = %file.path.display(),
                events = file.events,
                "Closed output file"
            );
        }
        Ok(())
    }

    fn is_file_open(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, event: &Event<'_>) -> Result<(), ModuleError> {
        let id = event.id();
        self.emit(&Record::Event {
            run: id.run,
            subrun: id.subrun,
            event: id.event,
            products: products_of(event.principal()),
        })?;
        self.events_written += 1;
        if let Some(file) = self.file.as_mut() {
            file.events += 1;
        }
        Ok(())
    }

    fn write_subrun(&mut self, subrun: &SubRunPrincipal) -> Result<(), ModuleError> {
        let id = subrun.id();
        self.emit(&Record::Subrun {
            run: id.run,
            subrun: id.subrun,
            begin_time: subrun.begin_time(),
            end_time: subrun.end_time(),
            products: products_of(subrun),
        })?;
        if let Some(file) = self.file.as_mut() {
            file.subruns += 1;
        }
        Ok(())
    }

    fn write_run(&mut self, run: &RunPrincipal) -> Result<(), ModuleError> {
        self.emit(&Record::Run {
            run: run.id().run,
            begin_time: run.begin_time(),
            end_time: run.end_time(),
            products: products_of(run),
        })?;
        if let Some(file) = self.file.as_mut() {
            file.runs += 1;
        }
        Ok(())
    }

    fn requests_file_switch(&self) -> bool {
        match (&self.file, self.max_events_per_file) {
            (Some(file), Some(max)) => file.events >= max,
            _ => false,
        }
    }

    fn switch_boundary(&self) -> SwitchBoundary {
        self.boundary
    }

    fn remaining_events(&self) -> Option<u64> {
        self.max_events.map(|max| max.saturating_sub(self.events_written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BranchType, EventId, EventPrincipal, ModuleKind, ModuleThreading, ProcessHistory, ProductKey, RunId};
    use tempfile::TempDir;

    fn description() -> ModuleDescription {
        ModuleDescription {
            label: "out".to_string(),
            module_type: "JsonlOutput".to_string(),
            parameter_set_id: String::new(),
            kind: ModuleKind::Output,
            threading: ModuleThreading::Legacy,
            process_name: "TEST".to_string(),
        }
    }

    fn output(yaml: &str) -> Result<JsonlOutput, FrameworkError> {
        let pset: ParameterSet = serde_yaml::from_str(yaml).unwrap();
        JsonlOutput::new(&description(), &pset)
    }

    fn write_events(out: &mut JsonlOutput, ids: std::ops::RangeInclusive<u32>) {
        for i in ids {
            let mut principal = EventPrincipal::new(EventId::new(1, 0, i), ProcessHistory::default());
            principal
                .put(ProductKey::new("int", "ints", "", "TEST"), serde_json::json!(i))
                .unwrap();
            let event = Event::new(&principal, BranchType::Event, "out", "TEST", &[]);
            out.write(&event).unwrap();
        }
    }

    fn records(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_writes_header_records_and_trailer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut out = output(&format!("fileName: {}\n", path.display())).unwrap();
        out.open_file(&FileBlock::new("in.txt")).unwrap();
        write_events(&mut out, 1..=2);
        out.write_run(&RunPrincipal::new(RunId::new(1), ProcessHistory::default()))
            .unwrap();
        out.close_file().unwrap();
        assert!(!out.is_file_open());

        let lines = records(&path);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["record"], "header");
        assert_eq!(lines[0]["input_file"], "in.txt");
        assert_eq!(lines[0]["guid"].as_str().unwrap().len(), 36);
        assert_eq!(lines[1]["record"], "event");
        assert_eq!(lines[2]["products"]["int_ints__TEST"], 2);
        assert_eq!(lines[3]["record"], "run");
        assert_eq!(lines[4]["record"], "trailer");
        assert_eq!(lines[4]["events"], 2);
    }

    #[test]
    fn test_requests_switch_after_max_events_per_file() {
        let dir = TempDir::new().unwrap();
        let pattern = dir.path().join("out_%#.jsonl");
        let mut out = output(&format!(
            "fileName: {}\nmaxEventsPerFile: 2\n",
            pattern.display()
        ))
        .unwrap();
        assert_eq!(out.switch_boundary(), SwitchBoundary::Event);

        out.open_file(&FileBlock::new("in")).unwrap();
        write_events(&mut out, 1..=1);
        assert!(!out.requests_file_switch());
        write_events(&mut out, 2..=2);
        assert!(out.requests_file_switch());

        out.open_file(&FileBlock::new("in")).unwrap();
        assert!(!out.requests_file_switch());
        out.close_file().unwrap();
        assert_eq!(out.written_paths().len(), 2);
        assert!(out.written_paths()[1].ends_with("out_2.jsonl"));
    }

    #[test]
    fn test_limit_reached_after_max_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut out = output(&format!("fileName: {}\nmaxEvents: 2\n", path.display())).unwrap();
        out.open_file(&FileBlock::new("in")).unwrap();
        write_events(&mut out, 1..=1);
        assert!(!out.limit_reached());
        write_events(&mut out, 2..=2);
        assert!(out.limit_reached());
    }

    #[test]
    fn test_reused_name_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut out = output(&format!("fileName: {}\n", path.display())).unwrap();
        out.open_file(&FileBlock::new("a")).unwrap();
        out.open_file(&FileBlock::new("b")).unwrap();
        out.close_file().unwrap();
        let lines = records(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2]["input_file"], "b");
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(output("{}").is_err());
        assert!(output("fileName: out.jsonl\nmaxEventsPerFile: 5\n").is_err());
        assert!(output("fileName: out_%#.jsonl\nmaxEventsPerFile: 0\n").is_err());
        assert!(output("fileName: out.jsonl\nfileSwitchBoundary: Job\n").is_err());
    }
}
