//! Progress marker protocol
//!
//! A stderr line starting with [`PROGRESS_MARKER`] carries a JSON object
//! `{percent?, message?, phase?}`. Anything else, including a marker followed
//! by malformed JSON, is surfaced as a raw output line.

use serde::Deserialize;
use tracing::trace;

use super::{StreamEvent, StreamName};
use crate::plugin::Phase;

/// Reserved prefix announcing structured progress data
pub const PROGRESS_MARKER: &str = "::progress::";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgressPayload {
    percent: Option<f64>,
    message: Option<String>,
    phase: Option<Phase>,
}

/// Classify one line read from a process channel
pub fn classify_line(line: String, stream: StreamName) -> StreamEvent {
    if stream == StreamName::Stderr {
        if let Some(payload) = line.strip_prefix(PROGRESS_MARKER) {
            match serde_json::from_str::<ProgressPayload>(payload.trim()) {
                Ok(progress) => {
                    return StreamEvent::Progress {
                        percent: progress.percent.map(|p| p.clamp(0.0, 100.0)),
                        message: progress.message,
                        phase: progress.phase,
                    };
                }
                Err(e) => {
                    trace!(error = %e, "malformed progress marker, keeping raw line");
                }
            }
        }
    }
    StreamEvent::Output { line, stream }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_progress_marker_parsed() {
        let event = classify_line(
            r#"::progress::{"percent": 42.5, "message": "fetching", "phase": "download"}"#.into(),
            StreamName::Stderr,
        );
        assert_eq!(
            event,
            StreamEvent::Progress {
                percent: Some(42.5),
                message: Some("fetching".into()),
                phase: Some(Phase::Download),
            }
        );
    }

    #[test]
    fn test_partial_payload_and_clamping() {
        let event = classify_line(r#"::progress:: {"percent": 140}"#.into(), StreamName::Stderr);
        assert_eq!(
            event,
            StreamEvent::Progress {
                percent: Some(100.0),
                message: None,
                phase: None,
            }
        );
    }

    #[test]
    fn test_malformed_marker_degrades_to_output() {
        let raw = r#"::progress::{"percent": 5"#.to_string();
        let event = classify_line(raw.clone(), StreamName::Stderr);
        assert_eq!(event, StreamEvent::output(raw, StreamName::Stderr));

        let raw = r#"::progress::["not", "an", "object"]"#.to_string();
        let event = classify_line(raw.clone(), StreamName::Stderr);
        assert_eq!(event, StreamEvent::output(raw, StreamName::Stderr));
    }

    #[test]
    fn test_marker_ignored_on_stdout() {
        let raw = r#"::progress::{"percent": 10}"#.to_string();
        let event = classify_line(raw.clone(), StreamName::Stdout);
        assert_eq!(event, StreamEvent::output(raw, StreamName::Stdout));
    }

    #[test]
    fn test_plain_stderr_line() {
        let event = classify_line("W: some warning".into(), StreamName::Stderr);
        assert_eq!(event, StreamEvent::output("W: some warning", StreamName::Stderr));
    }
}
