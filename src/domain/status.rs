//! Status codes returned by the processing loop.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of a call to the processing loop, also used as process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    Exception,
    Other,
    Signal,
    InputComplete,
    TimedOut,
    CountComplete,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Exception => 1,
            Self::Other => 2,
            Self::Signal => 3,
            Self::InputComplete => 4,
            Self::TimedOut => 5,
            Self::CountComplete => 6,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
