use std::time::Duration;
use thiserror::Error;

use crate::plugin::Phase;

/// Unified error type for the convoy runner
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Invalid declarations or configuration; blocks the run before any plugin starts
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        plugin: Option<String>,
    },

    /// The dependency graph contains a cycle; blocks the run
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    /// Mutexes for one phase could not be acquired in time
    #[error("Timed out after {timeout_ms}ms acquiring mutexes [{}] for {holder}", .mutexes.join(", "))]
    MutexTimeout {
        holder: String,
        mutexes: Vec<String>,
        timeout_ms: u64,
    },

    /// A phase body failed (non-zero exit or plugin logic error)
    #[error("Plugin {plugin} failed during {phase}: {message}")]
    PhaseExecution {
        plugin: String,
        phase: Phase,
        message: String,
    },

    /// The per-plugin timeout elapsed
    #[error("Plugin {plugin} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { plugin: String, timeout: Duration },

    /// The plugin was stopped before finishing
    #[error("Plugin {plugin} was cancelled: {reason}")]
    Cancelled { plugin: String, reason: String },

    /// IO errors (process spawning, pipes, files)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConvoyError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            plugin: None,
        }
    }

    /// Create a configuration error attributed to one plugin
    pub fn plugin_configuration<P: Into<String>, S: Into<String>>(plugin: P, message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            plugin: Some(plugin.into()),
        }
    }

    /// Create a cycle error from the plugins forming the cycle
    pub fn cycle(cycle: Vec<String>) -> Self {
        Self::Cycle { cycle }
    }

    /// Create a mutex acquisition timeout error
    pub fn mutex_timeout<S: Into<String>>(holder: S, mutexes: Vec<String>, timeout: Duration) -> Self {
        Self::MutexTimeout {
            holder: holder.into(),
            mutexes,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a phase execution error
    pub fn phase<P: Into<String>, M: Into<String>>(plugin: P, phase: Phase, message: M) -> Self {
        Self::PhaseExecution {
            plugin: plugin.into(),
            phase,
            message: message.into(),
        }
    }

    /// Create a per-plugin timeout error
    pub fn timeout<S: Into<String>>(plugin: S, timeout: Duration) -> Self {
        Self::Timeout {
            plugin: plugin.into(),
            timeout,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<P: Into<String>, R: Into<String>>(plugin: P, reason: R) -> Self {
        Self::Cancelled {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Fatal errors stop the whole run; everything else is scoped to one plugin
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Cycle { .. })
    }

    /// Get error category for logging and summaries
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Cycle { .. } => "cycle",
            Self::MutexTimeout { .. } => "mutex_timeout",
            Self::PhaseExecution { .. } => "phase_execution",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvoyError>;

impl From<std::io::Error> for ConvoyError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConvoyError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConvoyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
