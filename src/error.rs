//! Error vocabulary for the framework.
//!
//! Configuration problems, framework logic errors and module failures are
//! all expressed as [`FrameworkError`]. Whatever escapes the processing loop
//! is normalized into a single [`ProcessingError`] carrying the occurrences
//! that were open at the time of failure.

use std::any::Any;
use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use crate::domain::{EventId, RunId, SubRunId};

/// Category used for allocation failures reported by modules.
pub const OUT_OF_MEMORY: &str = "OutOfMemory";

/// Errors produced by the framework and its modules
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// Bad configuration detected before or while setting up processing
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The framework reached a state that indicates a bug
    #[error("Logic error: {0}")]
    Logic(String),

    /// A module callback failed
    #[error("Module '{label}' failed: {source}")]
    Module {
        label: String,
        #[source]
        source: ModuleError,
    },

    /// The input source failed to deliver an item
    #[error("Source error: {0}")]
    Source(String),

    /// Two occurrence fragments could not be combined
    #[error("Merge error: {0}")]
    Merge(String),

    /// I/O failure in a framework-owned file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure in a framework-owned record
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state machine passed through its Error state
    #[error("BadState: state machine exited after entering the Error state")]
    BadState,

    /// Several errors collected while still running every step
    #[error("{context}:\n{}", format_list(.messages))]
    Collected {
        context: String,
        messages: Vec<String>,
    },

    /// Normalized failure of a processing loop
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

fn format_list(messages: &[String]) -> String {
    messages
        .iter()
        .map(|m| format!("  {}", m))
        .collect::<Vec<_>>()
        .join("\n")
}

impl FrameworkError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    pub fn module(label: impl Into<String>, source: ModuleError) -> Self {
        Self::Module {
            label: label.into(),
            source,
        }
    }

    /// Category name used by the exception action table
    pub fn category(&self) -> &str {
        match self {
            Self::Configuration(_) => "Configuration",
            Self::Logic(_) => "LogicError",
            Self::Module { source, .. } => &source.category,
            Self::Source(_) => "SourceError",
            Self::Merge(_) => "MismatchedInputFiles",
            Self::Io(_) => "FileReadError",
            Self::Serialization(_) => "ProductSerialization",
            Self::BadState => "BadState",
            Self::Collected { .. } => "EndJobFailure",
            Self::Processing(p) => p.kind.label(),
        }
    }

    /// True when the failure originates from memory exhaustion
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::Module { source, .. } => source.is_out_of_memory(),
            Self::Processing(p) => p.kind == FailureKind::OutOfMemory,
            _ => false,
        }
    }
}

/// Failure reported by module code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{category}] {message}")]
pub struct ModuleError {
    /// Category looked up in the exception action table
    pub category: String,

    /// Human readable description
    pub message: String,
}

impl ModuleError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(OUT_OF_MEMORY, message)
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.category == OUT_OF_MEMORY
    }
}

impl From<TryReserveError> for ModuleError {
    fn from(err: TryReserveError) -> Self {
        Self::out_of_memory(err.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("ProductSerialization", err.to_string())
    }
}

/// Origin of a failure that crossed the processing loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// A framework or module error with its category
    Framework(String),
    /// Allocation failure
    OutOfMemory,
    /// I/O or serialization failure from the standard library stack
    Std,
    /// A panic carrying a string payload
    StringPanic,
    /// A panic with an opaque payload
    Unknown,
}

impl FailureKind {
    pub fn label(&self) -> &str {
        match self {
            Self::Framework(category) => category,
            Self::OutOfMemory => OUT_OF_MEMORY,
            Self::Std => "StdException",
            Self::StringPanic | Self::Unknown => "Unknown",
        }
    }
}

/// An occurrence that was open when processing failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOccurrence {
    File(String),
    Run(RunId),
    SubRun(SubRunId),
    Event(EventId),
}

impl fmt::Display for OpenOccurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(name) => write!(f, "input file '{}'", name),
            Self::Run(id) => write!(f, "{}", id),
            Self::SubRun(id) => write!(f, "{}", id),
            Self::Event(id) => write!(f, "{}", id),
        }
    }
}

/// The single error shape observed by callers of the processing loop
#[derive(Debug, Clone, Error)]
pub struct ProcessingError {
    /// Where the failure came from
    pub kind: FailureKind,

    /// Description of the primary failure
    pub message: String,

    /// Occurrences left open when the failure happened, outermost first
    pub open_occurrences: Vec<OpenOccurrence>,

    /// Secondary failures swallowed while tearing down
    pub cleanup_messages: Vec<String>,
}

impl ProcessingError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            open_occurrences: Vec::new(),
            cleanup_messages: Vec::new(),
        }
    }

    /// Normalize an error returned through the loop
    pub fn from_error(err: FrameworkError) -> Self {
        match err {
            FrameworkError::Processing(p) => p,
            FrameworkError::Io(e) => Self::new(FailureKind::Std, e.to_string()),
            FrameworkError::Serialization(e) => Self::new(FailureKind::Std, e.to_string()),
            other if other.is_out_of_memory() => Self::new(
                FailureKind::OutOfMemory,
                format!(
                    "Memory allocation failed; the job has probably exhausted available memory\n{}",
                    other
                ),
            ),
            other => Self::new(FailureKind::Framework(other.category().to_string()), other.to_string()),
        }
    }

    /// Normalize a panic payload caught at the loop boundary
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self::new(FailureKind::StringPanic, *s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::new(FailureKind::StringPanic, s.clone())
        } else {
            Self::new(FailureKind::Unknown, "an unknown failure was caught")
        }
    }

    pub fn with_open_occurrences(mut self, open: Vec<OpenOccurrence>) -> Self {
        self.open_occurrences = open;
        self
    }

    pub fn with_cleanup_messages(mut self, messages: Vec<String>) -> Self {
        self.cleanup_messages.extend(messages);
        self
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)?;
        if !self.open_occurrences.is_empty() {
            let open: Vec<String> = self.open_occurrences.iter().map(|o| o.to_string()).collect();
            write!(f, "\nOpen at time of failure: {}", open.join(", "))?;
        }
        for msg in &self.cleanup_messages {
            write!(f, "\n{}", msg)?;
        }
        Ok(())
    }
}

/// Runs every step, remembering failures instead of stopping at the first
#[derive(Debug, Default)]
pub struct ErrorCollector {
    messages: Vec<String>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call<F>(&mut self, f: F)
    where
        F: FnOnce() -> Result<(), FrameworkError>,
    {
        if let Err(e) = f() {
            self.messages.push(e.to_string());
        }
    }

    pub fn push(&mut self, err: FrameworkError) {
        self.messages.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn finish(self, context: &str) -> Result<(), FrameworkError> {
        if self.messages.is_empty() {
            Ok(())
        } else {
            Err(FrameworkError::Collected {
                context: context.to_string(),
                messages: self.messages,
            })
        }
    }
}
