use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{ConvoyError, Result};

/// How mutex declarations influence wave construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Waves follow dependencies only; mutex conflicts are serialized at runtime
    #[default]
    Runtime,
    /// Waves are additionally split so no two plugins in a wave share a mutex in the same phase
    ScheduleTime,
}

/// Per-run configuration handed to the orchestrator at start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Per-plugin timeout; overrides the plugin's own default when set
    pub plugin_timeout_secs: Option<u64>,
    /// How long a phase may wait for its mutexes
    pub mutex_timeout_secs: u64,
    /// Capacity of the bounded event queue shared by a process's two readers
    pub queue_capacity: usize,
    /// How long a reader waits for queue space before dropping an event
    pub enqueue_timeout_ms: u64,
    /// Minimum spacing between drop warnings from one reader
    pub drop_warning_interval_ms: u64,
    /// Longest output line a reader buffers; the excess is discarded
    pub max_line_bytes: usize,
    /// Maximum output lines kept in a plugin's captured output
    pub max_captured_lines: usize,
    /// Wave construction mode
    pub scheduling: SchedulingMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_secs: None,
            mutex_timeout_secs: 600,
            queue_capacity: 1000,
            enqueue_timeout_ms: 100,
            drop_warning_interval_ms: 5000,
            max_line_bytes: 64 * 1024,
            max_captured_lines: 10_000,
            scheduling: SchedulingMode::Runtime,
        }
    }
}

impl RunConfig {
    /// Parse a configuration from YAML, filling unspecified fields with defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.plugin_timeout_secs == Some(0) {
            return Err(ConvoyError::configuration(
                "plugin_timeout_secs must be greater than 0",
            ));
        }
        if self.mutex_timeout_secs == 0 {
            return Err(ConvoyError::configuration(
                "mutex_timeout_secs must be greater than 0",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConvoyError::configuration(
                "queue_capacity must be greater than 0",
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConvoyError::configuration(
                "max_line_bytes must be greater than 0",
            ));
        }
        if self.max_captured_lines == 0 {
            return Err(ConvoyError::configuration(
                "max_captured_lines must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn plugin_timeout(&self) -> Option<Duration> {
        self.plugin_timeout_secs.map(Duration::from_secs)
    }

    pub fn mutex_timeout(&self) -> Duration {
        Duration::from_secs(self.mutex_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn drop_warning_interval(&self) -> Duration {
        Duration::from_millis(self.drop_warning_interval_ms)
    }

    pub fn with_plugin_timeout(mut self, secs: u64) -> Self {
        self.plugin_timeout_secs = Some(secs);
        self
    }

    pub fn with_mutex_timeout(mut self, secs: u64) -> Self {
        self.mutex_timeout_secs = secs;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_enqueue_timeout_ms(mut self, ms: u64) -> Self {
        self.enqueue_timeout_ms = ms;
        self
    }

    pub fn with_max_line_bytes(mut self, bytes: usize) -> Self {
        self.max_line_bytes = bytes;
        self
    }

    pub fn with_max_captured_lines(mut self, lines: usize) -> Self {
        self.max_captured_lines = lines;
        self
    }

    pub fn with_scheduling(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.scheduling, SchedulingMode::Runtime);
        assert!(config.plugin_timeout().is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RunConfig::default().with_queue_capacity(0).validate().is_err());
        assert!(RunConfig::default().with_mutex_timeout(0).validate().is_err());
        assert!(RunConfig::default().with_plugin_timeout(0).validate().is_err());
        assert!(RunConfig::default().with_max_captured_lines(0).validate().is_err());
        assert!(RunConfig::default().with_max_line_bytes(0).validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = RunConfig::from_yaml_str(
            "plugin_timeout_secs: 30\nscheduling: schedule_time\n",
        )
        .unwrap();
        assert_eq!(config.plugin_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.scheduling, SchedulingMode::ScheduleTime);
        assert_eq!(config.mutex_timeout_secs, 600);
        assert_eq!(config.enqueue_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_line_bytes, 65536);
    }

    #[test]
    fn test_yaml_validation_error() {
        let err = RunConfig::from_yaml_str("queue_capacity: 0\n").unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
