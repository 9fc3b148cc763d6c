//! Wave-by-wave execution
//!
//! Plugins in one wave run concurrently, each on its own task, with phases
//! in order and each phase's mutexes held only while that phase runs. A
//! failed plugin takes down only itself and whatever depends on it.

pub mod runner;
pub mod summary;

pub use runner::{Orchestrator, StopHandle};
pub use summary::{CapturedOutput, ExecutionResult, ExecutionSummary, PluginStatus, SummaryBuilder};
