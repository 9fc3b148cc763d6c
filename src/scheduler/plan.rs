use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of plugins that may run concurrently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWave {
    pub index: usize,
    /// Plugin names; the order carries no meaning
    pub plugins: Vec<String>,
}

impl ExecutionWave {
    pub fn contains(&self, plugin: &str) -> bool {
        self.plugins.iter().any(|p| p == plugin)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Ordered waves produced by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<ExecutionWave>,
}

impl ExecutionPlan {
    /// Build a plan from explicit wave contents
    pub fn from_waves<I, W, S>(waves: I) -> Self
    where
        I: IntoIterator<Item = W>,
        W: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let waves = waves
            .into_iter()
            .enumerate()
            .map(|(index, plugins)| ExecutionWave {
                index,
                plugins: plugins.into_iter().map(Into::into).collect(),
            })
            .collect();
        Self { waves }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionWave> {
        self.waves.iter()
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Index of the wave containing `plugin`
    pub fn wave_of(&self, plugin: &str) -> Option<usize> {
        self.waves
            .iter()
            .find(|wave| wave.contains(plugin))
            .map(|wave| wave.index)
    }

    pub fn plugin_count(&self) -> usize {
        self.waves.iter().map(ExecutionWave::len).sum()
    }

    /// Every planned plugin, wave by wave
    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.waves
            .iter()
            .flat_map(|wave| wave.plugins.iter().map(String::as_str))
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for wave in &self.waves {
            writeln!(f, "wave {}: {}", wave.index + 1, wave.plugins.join(", "))?;
        }
        Ok(())
    }
}
