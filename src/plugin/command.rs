//! Subprocess-backed plugins declared in a YAML manifest
//!
//! ```yaml
//! config:
//!   plugin_timeout_secs: 900
//! plugins:
//!   - name: apt
//!     mutexes:
//!       download: [network]
//!       execute: ["pkgmgr:dpkg"]
//!     commands:
//!       check: [apt-get, update]
//!       execute: [apt-get, -y, upgrade]
//!   - name: flatpak
//!     dependencies: [apt]
//!     commands:
//!       execute: [flatpak, update, -y]
//! ```

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{Phase, PhaseContext, PhaseStream, Plugin};
use crate::core::config::RunConfig;
use crate::core::errors::{ConvoyError, Result};
use crate::stream::StreamMerger;

/// Declaration of one command plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPluginSpec {
    pub name: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub mutexes: BTreeMap<Phase, BTreeSet<String>>,
    /// Program and arguments per phase; a phase without a command does nothing
    #[serde(default)]
    pub commands: BTreeMap<Phase, Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandPluginSpec {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConvoyError::configuration("plugin name must not be empty"));
        }
        for (phase, argv) in &self.commands {
            if argv.first().map_or(true, |program| program.is_empty()) {
                return Err(ConvoyError::plugin_configuration(
                    &self.name,
                    format!("{} command of plugin '{}' is empty", phase, self.name),
                ));
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(ConvoyError::plugin_configuration(
                &self.name,
                format!("timeout_secs of plugin '{}' must be greater than 0", self.name),
            ));
        }
        Ok(())
    }
}

/// Default adapter: each phase runs one external command through the stream merger
#[derive(Debug, Clone)]
pub struct CommandPlugin {
    spec: CommandPluginSpec,
}

impl CommandPlugin {
    pub fn new(spec: CommandPluginSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &CommandPluginSpec {
        &self.spec
    }
}

#[async_trait]
impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn dependencies(&self) -> BTreeSet<String> {
        self.spec.dependencies.clone()
    }

    fn mutexes(&self, phase: Phase) -> BTreeSet<String> {
        self.spec.mutexes.get(&phase).cloned().unwrap_or_default()
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    async fn run_phase(&self, phase: Phase, ctx: &PhaseContext) -> Result<PhaseStream> {
        let Some((program, args)) = self
            .spec
            .commands
            .get(&phase)
            .and_then(|argv| argv.split_first())
        else {
            debug!(plugin = %self.spec.name, %phase, "no command for phase");
            return Ok(stream::empty().boxed());
        };

        debug!(plugin = %self.spec.name, %phase, program = %program, ?args, "spawning phase command");
        let mut command = Command::new(program);
        command.args(args).envs(&self.spec.env);
        let merged = StreamMerger::spawn(&mut command, ctx.stream_options())?;
        Ok(merged.into_stream())
    }
}

/// A YAML file listing command plugins and the run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub plugins: Vec<CommandPluginSpec>,
}

impl PluginManifest {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.config.validate()?;
        for spec in &manifest.plugins {
            spec.validate()?;
        }
        Ok(manifest)
    }

    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ConvoyError::io(format!("read manifest {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Instantiate every declared plugin
    pub fn plugins(&self) -> Result<Vec<Arc<dyn Plugin>>> {
        self.plugins
            .iter()
            .cloned()
            .map(|spec| CommandPlugin::new(spec).map(|p| Arc::new(p) as Arc<dyn Plugin>))
            .collect()
    }
}
