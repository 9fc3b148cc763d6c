use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::scheduler::ExecutionPlan;

/// Terminal state of one plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Succeeded => f.write_str("succeeded"),
            PluginStatus::Failed => f.write_str("failed"),
            PluginStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Outcome of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plugin: String,
    pub status: PluginStatus,
    pub success: bool,
    /// True when the plugin never started
    pub skipped: bool,
    /// Captured output lines, joined by newlines
    pub output: String,
    /// Every output line seen, including lines beyond the capture limit
    pub output_lines: usize,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(plugin: impl Into<String>, output: CapturedOutput, duration: Duration) -> Self {
        Self {
            plugin: plugin.into(),
            status: PluginStatus::Succeeded,
            success: true,
            skipped: false,
            output: output.text(),
            output_lines: output.total_lines(),
            duration_seconds: duration.as_secs_f64(),
            error_message: None,
        }
    }

    pub fn failed(
        plugin: impl Into<String>,
        error: impl Into<String>,
        output: CapturedOutput,
        duration: Duration,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            status: PluginStatus::Failed,
            success: false,
            skipped: false,
            output: output.text(),
            output_lines: output.total_lines(),
            duration_seconds: duration.as_secs_f64(),
            error_message: Some(error.into()),
        }
    }

    pub fn skipped(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            status: PluginStatus::Skipped,
            success: false,
            skipped: true,
            output: String::new(),
            output_lines: 0,
            duration_seconds: 0.0,
            error_message: Some(reason.into()),
        }
    }
}

/// Output lines kept for a plugin's result
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    lines: Vec<String>,
    total: usize,
    limit: usize,
}

impl CapturedOutput {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            total: 0,
            limit,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.total += 1;
        if self.lines.len() < self.limit {
            self.lines.push(line.to_string());
        }
    }

    pub fn total_lines(&self) -> usize {
        self.total
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Aggregate outcome of a run, handed to reporting once the run ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub total_duration_seconds: f64,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// True when every plugin succeeded
    pub success: bool,
    /// One entry per planned plugin, in plan order
    pub results: Vec<ExecutionResult>,
}

impl ExecutionSummary {
    pub fn result(&self, plugin: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.plugin == plugin)
    }

    pub fn status_of(&self, plugin: &str) -> Option<PluginStatus> {
        self.result(plugin).map(|r| r.status)
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// Collects results while a run is in flight.
///
/// Each plugin owns one slot, so concurrent writers never touch the same entry.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    slots: DashMap<String, ExecutionResult>,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: ExecutionResult) {
        self.slots.insert(result.plugin.clone(), result);
    }

    pub fn status_of(&self, plugin: &str) -> Option<PluginStatus> {
        self.slots.get(plugin).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Freeze into a summary ordered by `plan`. Planned plugins without a
    /// recorded result are reported as skipped.
    pub fn finish(
        self,
        run_id: impl Into<String>,
        started_at: DateTime<Utc>,
        total: Duration,
        plan: &ExecutionPlan,
    ) -> ExecutionSummary {
        let results: Vec<ExecutionResult> = plan
            .plugins()
            .map(|name| match self.slots.remove(name) {
                Some((_, result)) => result,
                None => ExecutionResult::skipped(name, "plugin was never scheduled"),
            })
            .collect();

        let count = |status: PluginStatus| results.iter().filter(|r| r.status == status).count();
        let succeeded = count(PluginStatus::Succeeded);
        let failed = count(PluginStatus::Failed);
        let skipped = count(PluginStatus::Skipped);

        ExecutionSummary {
            run_id: run_id.into(),
            started_at,
            total_duration_seconds: total.as_secs_f64(),
            succeeded,
            failed,
            skipped,
            success: failed == 0 && skipped == 0,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capture_limit_keeps_count() {
        let mut output = CapturedOutput::with_limit(2);
        for line in ["a", "b", "c"] {
            output.push(line);
        }
        assert_eq!(output.text(), "a\nb");
        assert_eq!(output.total_lines(), 3);
    }

    #[test]
    fn test_summary_counts_and_order() {
        let plan = ExecutionPlan::from_waves(vec![vec!["apt", "brew"], vec!["flatpak"], vec!["snap"]]);
        let builder = SummaryBuilder::new();
        builder.record(ExecutionResult::skipped("flatpak", "dependency 'apt' did not succeed"));
        builder.record(ExecutionResult::failed(
            "apt",
            "exit 1",
            CapturedOutput::with_limit(10),
            Duration::from_millis(20),
        ));
        builder.record(ExecutionResult::succeeded(
            "brew",
            CapturedOutput::with_limit(10),
            Duration::from_millis(10),
        ));
        assert_eq!(builder.status_of("apt"), Some(PluginStatus::Failed));

        let summary = builder.finish("run", Utc::now(), Duration::from_secs(1), &plan);
        let order: Vec<&str> = summary.results.iter().map(|r| r.plugin.as_str()).collect();
        assert_eq!(order, vec!["apt", "brew", "flatpak", "snap"]);
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 2));
        assert!(!summary.success);
        assert_eq!(summary.status_of("snap"), Some(PluginStatus::Skipped));
    }

    #[test]
    fn test_summary_serializes_status_lowercase() {
        let plan = ExecutionPlan::from_waves(vec![vec!["apt"]]);
        let builder = SummaryBuilder::new();
        builder.record(ExecutionResult::succeeded(
            "apt",
            CapturedOutput::with_limit(1),
            Duration::ZERO,
        ));
        let summary = builder.finish("run", Utc::now(), Duration::ZERO, &plan);
        assert!(summary.success);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["results"][0]["status"], "succeeded");
        assert_eq!(json["run_id"], "run");
    }
}
