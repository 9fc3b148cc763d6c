//! Stream merging
//!
//! Turns a subprocess's stdout and stderr into one ordered, backpressured
//! sequence of [`StreamEvent`]s with structured progress parsing.

pub mod merger;
pub mod progress;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::plugin::Phase;

pub use merger::{MergedStream, StreamMerger, StreamOptions};
pub use progress::{classify_line, PROGRESS_MARKER};

/// Which output channel of a process a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamName::Stdout => f.write_str("stdout"),
            StreamName::Stderr => f.write_str("stderr"),
        }
    }
}

/// One item of a plugin's merged event sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A raw output line
    Output { line: String, stream: StreamName },
    /// Structured progress reported through the progress marker protocol
    Progress {
        percent: Option<f64>,
        message: Option<String>,
        phase: Option<Phase>,
    },
    /// A phase boundary
    Phase { phase: Phase, started: bool },
    /// Terminal status of the producing process or phase
    Completion {
        success: bool,
        exit_code: Option<i32>,
        error_message: Option<String>,
    },
}

impl StreamEvent {
    pub fn output(line: impl Into<String>, stream: StreamName) -> Self {
        StreamEvent::Output {
            line: line.into(),
            stream,
        }
    }

    pub fn progress(percent: f64, message: impl Into<String>) -> Self {
        StreamEvent::Progress {
            percent: Some(percent),
            message: Some(message.into()),
            phase: None,
        }
    }

    pub fn succeeded() -> Self {
        StreamEvent::Completion {
            success: true,
            exit_code: Some(0),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StreamEvent::Completion {
            success: false,
            exit_code: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, StreamEvent::Completion { .. })
    }
}
