//! Plugin capability interface
//!
//! A plugin is one package-manager integration. It declares what it depends
//! on and which named mutexes each phase needs, and produces an event
//! sequence per phase. It never decides when it runs.

pub mod command;
pub mod registry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RunConfig;
use crate::core::errors::Result;
use crate::stream::{StreamEvent, StreamOptions};

pub use command::{CommandPlugin, CommandPluginSpec, PluginManifest};
pub use registry::PluginRegistry;

/// Ordered stage of a plugin run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Check,
    Download,
    Execute,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 3] = [Phase::Check, Phase::Download, Phase::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Check => "check",
            Phase::Download => "download",
            Phase::Execute => "execute",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable scheduling facts a plugin supplies before planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDeclaration {
    pub name: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub mutexes_by_phase: BTreeMap<Phase, BTreeSet<String>>,
}

impl PluginDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            mutexes_by_phase: BTreeMap::new(),
        }
    }

    /// Add a dependency
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Add a mutex for one phase
    pub fn with_mutex(mut self, phase: Phase, mutex: impl Into<String>) -> Self {
        self.mutexes_by_phase
            .entry(phase)
            .or_default()
            .insert(mutex.into());
        self
    }

    /// Mutexes for a phase; empty when none are declared
    pub fn mutexes(&self, phase: Phase) -> BTreeSet<String> {
        self.mutexes_by_phase
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    /// True when both declarations name a common mutex in the same phase
    pub fn conflicts_with(&self, other: &PluginDeclaration) -> bool {
        Phase::ALL.iter().any(|phase| {
            match (self.mutexes_by_phase.get(phase), other.mutexes_by_phase.get(phase)) {
                (Some(a), Some(b)) => !a.is_disjoint(b),
                _ => false,
            }
        })
    }
}

/// The merged event sequence produced by one phase
pub type PhaseStream = BoxStream<'static, StreamEvent>;

/// What a plugin sees while running one phase
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: String,
    pub plugin: String,
    pub phase: Phase,
    pub config: Arc<RunConfig>,
}

impl PhaseContext {
    /// Stream merger settings derived from the run configuration
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::from_config(&self.config)
    }
}

/// Capability interface implemented by every update plugin
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name
    fn name(&self) -> &str;

    /// Plugins that must complete successfully before this one starts
    fn dependencies(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Named mutexes held for the duration of a phase
    fn mutexes(&self, _phase: Phase) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Plugin-specific default timeout for the whole run
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Start one phase and return its event sequence.
    ///
    /// The sequence is consumed while the phase's mutexes are held. A
    /// `CompletionEvent` with `success: false` fails the phase; a sequence
    /// that ends without one is treated as successful.
    async fn run_phase(&self, phase: Phase, ctx: &PhaseContext) -> Result<PhaseStream>;

    /// Scheduling declaration assembled from the query methods
    fn declaration(&self) -> PluginDeclaration {
        let mut mutexes_by_phase = BTreeMap::new();
        for phase in Phase::ALL {
            let set = self.mutexes(phase);
            if !set.is_empty() {
                mutexes_by_phase.insert(phase, set);
            }
        }
        PluginDeclaration {
            name: self.name().to_string(),
            dependencies: self.dependencies(),
            mutexes_by_phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(Phase::Check < Phase::Download);
        assert!(Phase::Download < Phase::Execute);
        assert_eq!(Phase::ALL[0], Phase::Check);
        assert_eq!(Phase::Execute.to_string(), "execute");
    }

    #[test]
    fn test_conflict_requires_same_phase() {
        let apt = PluginDeclaration::new("apt").with_mutex(Phase::Execute, "pkgdb");
        let dpkg = PluginDeclaration::new("dpkg").with_mutex(Phase::Execute, "pkgdb");
        let snap = PluginDeclaration::new("snap").with_mutex(Phase::Download, "pkgdb");

        assert!(apt.conflicts_with(&dpkg));
        assert!(!apt.conflicts_with(&snap));
        assert!(apt.mutexes(Phase::Check).is_empty());
    }

    #[test]
    fn test_declaration_from_yaml() {
        let decl: PluginDeclaration = serde_yaml::from_str(
            "name: flatpak\ndependencies: [apt]\nmutexes_by_phase:\n  download: [network]\n",
        )
        .unwrap();
        assert_eq!(decl.name, "flatpak");
        assert!(decl.dependencies.contains("apt"));
        assert!(decl.mutexes(Phase::Download).contains("network"));
    }
}
