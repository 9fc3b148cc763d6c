// Shared infrastructure
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod plugin;      // Capability interface and command adapter
pub mod scheduler;   // Dependency layering into waves
pub mod coord;       // Named exclusive mutexes
pub mod stream;      // Subprocess output merging
pub mod events;      // Run event forwarding
pub mod orchestrator;

// Re-exports for convenience
pub use core::config::{RunConfig, SchedulingMode};
pub use core::errors::{ConvoyError, Result};
pub use coord::{HeldMutexes, MutexCoordinator};
pub use events::{
    BroadcastEventSink, BufferingEventSink, ChannelEventSink, EventSink, LoggingEventSink,
    RunEventEnvelope,
};
pub use orchestrator::{ExecutionResult, ExecutionSummary, Orchestrator, PluginStatus, StopHandle};
pub use plugin::{
    CommandPlugin, CommandPluginSpec, Phase, PhaseContext, PhaseStream, Plugin, PluginDeclaration,
    PluginManifest, PluginRegistry,
};
pub use scheduler::{build_plan, build_plan_with, ExecutionPlan, ExecutionWave};
pub use stream::{MergedStream, StreamEvent, StreamMerger, StreamName, StreamOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use std::sync::Arc;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run_phase(&self, phase: Phase, _ctx: &PhaseContext) -> Result<PhaseStream> {
            Ok(stream::once(async move {
                StreamEvent::output(format!("running {}", phase), StreamName::Stdout)
            })
            .boxed())
        }
    }

    #[tokio::test]
    async fn test_single_in_process_plugin() {
        let orchestrator = Orchestrator::new(RunConfig::default(), Arc::new(LoggingEventSink));
        let summary = orchestrator.run_plugins(vec![Arc::new(Echo) as Arc<dyn Plugin>]).await.unwrap();

        assert!(summary.success);
        assert_eq!(summary.succeeded, 1);
        let echo = summary.result("echo").unwrap();
        assert_eq!(echo.output_lines, 3);
        assert_eq!(echo.output, "running check\nrunning download\nrunning execute");
        assert!(!summary.run_id.is_empty());
    }
}
