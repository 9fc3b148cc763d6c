use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::summary::{CapturedOutput, ExecutionResult, ExecutionSummary, PluginStatus, SummaryBuilder};
use crate::coord::MutexCoordinator;
use crate::core::config::RunConfig;
use crate::core::errors::{ConvoyError, Result};
use crate::events::{EventEmitter, EventSink};
use crate::plugin::{Phase, PhaseContext, Plugin, PluginRegistry};
use crate::scheduler::{build_plan_with, ExecutionPlan};
use crate::stream::StreamEvent;

/// Requests that an in-flight run stop.
///
/// Running plugins are cancelled and fail; plugins that have not started yet
/// are skipped. Once stopped, an orchestrator stays stopped.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        info!("stop requested");
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Runs an execution plan wave by wave
pub struct Orchestrator {
    config: Arc<RunConfig>,
    sink: Arc<dyn EventSink>,
    stop: StopHandle,
}

impl Orchestrator {
    pub fn new(config: RunConfig, sink: Arc<dyn EventSink>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            sink,
            stop: StopHandle { tx: Arc::new(tx) },
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Plan and run `plugins` using the configured scheduling mode
    pub async fn run_plugins(&self, plugins: Vec<Arc<dyn Plugin>>) -> Result<ExecutionSummary> {
        let registry = PluginRegistry::new();
        for plugin in plugins {
            registry.register(plugin)?;
        }
        let plan = build_plan_with(&registry.declarations(), self.config.scheduling)?;
        self.run_all(&plan, &registry.handles()).await
    }

    /// Run every wave of `plan` in order.
    ///
    /// Only a plan naming a plugin with no handle is an error; plugin
    /// failures are recorded in the summary. Dropping the returned future
    /// aborts the plugins of the current wave.
    pub async fn run_all(
        &self,
        plan: &ExecutionPlan,
        plugins: &HashMap<String, Arc<dyn Plugin>>,
    ) -> Result<ExecutionSummary> {
        if let Some(missing) = plan.plugins().find(|name| !plugins.contains_key(*name)) {
            return Err(ConvoyError::plugin_configuration(
                missing,
                format!("plan names plugin '{}' but no handle was supplied", missing),
            ));
        }

        let run_id = cuid2::create_id();
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let runner = PluginRunner {
            config: self.config.clone(),
            emitter: Arc::new(EventEmitter::new(run_id.clone(), self.sink.clone())),
            coordinator: MutexCoordinator::new(),
            stop_rx: self.stop.tx.subscribe(),
        };
        let results = SummaryBuilder::new();

        info!(
            run_id = %run_id,
            waves = plan.len(),
            plugins = plan.plugin_count(),
            "starting run"
        );

        for wave in plan.iter() {
            info!(wave = wave.index + 1, plugins = ?wave.plugins, "starting wave");
            let wave_start = Instant::now();
            let mut tasks = JoinSet::new();
            let mut launched = Vec::new();

            for name in &wave.plugins {
                let Some(plugin) = plugins.get(name) else {
                    continue;
                };
                if let Some(reason) = self.skip_reason(plugin.as_ref(), &results) {
                    info!(plugin = %name, %reason, "plugin skipped");
                    results.record(ExecutionResult::skipped(name, reason));
                    continue;
                }
                tasks.spawn(guarded(runner.clone(), plugin.clone()));
                launched.push(name.clone());
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.record(result),
                    Err(e) => warn!(error = %e, "plugin task did not complete"),
                }
            }
            for name in launched {
                if results.status_of(&name).is_none() {
                    results.record(ExecutionResult::failed(
                        &name,
                        "plugin task failed",
                        CapturedOutput::default(),
                        wave_start.elapsed(),
                    ));
                }
            }

            info!(
                wave = wave.index + 1,
                elapsed_ms = wave_start.elapsed().as_millis() as u64,
                "wave finished"
            );
        }

        let summary = results.finish(run_id, started_at, start.elapsed(), plan);
        info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_secs = summary.total_duration_seconds,
            "run finished"
        );
        Ok(summary)
    }

    fn skip_reason(&self, plugin: &dyn Plugin, results: &SummaryBuilder) -> Option<String> {
        if self.stop.is_stopped() {
            return Some("run stopped".to_string());
        }
        plugin
            .dependencies()
            .into_iter()
            .find(|dep| results.status_of(dep) != Some(PluginStatus::Succeeded))
            .map(|dep| format!("dependency '{}' did not succeed", dep))
    }
}

/// Run one plugin, turning a panic inside it into a failed result
async fn guarded(runner: PluginRunner, plugin: Arc<dyn Plugin>) -> ExecutionResult {
    let name = plugin.name().to_string();
    let start = Instant::now();
    match AssertUnwindSafe(runner.run(plugin)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!(plugin = %name, "plugin task panicked");
            ExecutionResult::failed(
                name,
                "plugin task panicked",
                CapturedOutput::default(),
                start.elapsed(),
            )
        }
    }
}

/// Per-run state shared by every plugin task
#[derive(Clone)]
struct PluginRunner {
    config: Arc<RunConfig>,
    emitter: Arc<EventEmitter>,
    coordinator: MutexCoordinator,
    stop_rx: watch::Receiver<bool>,
}

impl PluginRunner {
    async fn run(self, plugin: Arc<dyn Plugin>) -> ExecutionResult {
        let name = plugin.name().to_string();
        let start = Instant::now();
        let timeout = self.config.plugin_timeout().or_else(|| plugin.timeout());
        let mut output = CapturedOutput::with_limit(self.config.max_captured_lines);
        let mut current: Option<Phase> = None;

        info!(plugin = %name, timeout_secs = ?timeout.map(|t| t.as_secs()), "plugin started");

        let outcome = {
            let phases = self.run_phases(plugin.as_ref(), &mut output, &mut current);
            tokio::select! {
                result = phases => result,
                limit = deadline(timeout) => Err(ConvoyError::timeout(&name, limit)),
                _ = stopped(self.stop_rx.clone()) => Err(ConvoyError::cancelled(&name, "run stopped")),
            }
        };

        match outcome {
            Ok(()) => {
                info!(plugin = %name, elapsed_ms = start.elapsed().as_millis() as u64, "plugin succeeded");
                ExecutionResult::succeeded(name, output, start.elapsed())
            }
            Err(e) => {
                // A cut-short phase never delivered its own end events
                if let Some(phase) = current {
                    if matches!(e, ConvoyError::Timeout { .. } | ConvoyError::Cancelled { .. }) {
                        self.emitter.emit(&name, StreamEvent::failed(e.to_string()));
                        self.emitter.emit(&name, StreamEvent::Phase { phase, started: false });
                    }
                }
                let message = describe(&e);
                info!(plugin = %name, category = e.category(), error = %message, "plugin failed");
                ExecutionResult::failed(name, message, output, start.elapsed())
            }
        }
    }

    async fn run_phases(
        &self,
        plugin: &dyn Plugin,
        output: &mut CapturedOutput,
        current: &mut Option<Phase>,
    ) -> Result<()> {
        let name = plugin.name();
        for phase in Phase::ALL {
            *current = Some(phase);
            self.emitter.emit(name, StreamEvent::Phase { phase, started: true });
            let result = self.run_phase(plugin, phase, output).await;
            self.emitter.emit(name, StreamEvent::Phase { phase, started: false });
            *current = None;
            result?;
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        plugin: &dyn Plugin,
        phase: Phase,
        output: &mut CapturedOutput,
    ) -> Result<()> {
        let name = plugin.name();
        let mutexes = plugin.mutexes(phase);
        // Released when this function returns, however it returns
        let _held = if mutexes.is_empty() {
            None
        } else {
            Some(
                self.coordinator
                    .acquire_guard(name, mutexes, self.config.mutex_timeout())
                    .await?,
            )
        };

        let ctx = PhaseContext {
            run_id: self.emitter.run_id().to_string(),
            plugin: name.to_string(),
            phase,
            config: self.config.clone(),
        };
        let mut events = plugin.run_phase(phase, &ctx).await?;

        let mut failure: Option<String> = None;
        while let Some(event) = events.next().await {
            match &event {
                StreamEvent::Output { line, .. } => output.push(line),
                StreamEvent::Completion {
                    success: false,
                    exit_code,
                    error_message,
                } => {
                    failure = Some(match (error_message, exit_code) {
                        (Some(message), _) => message.clone(),
                        (None, Some(code)) => format!("exited with code {}", code),
                        (None, None) => "phase reported failure".to_string(),
                    });
                }
                _ => {}
            }
            self.emitter.emit(name, event);
        }
        debug!(plugin = %name, %phase, "phase stream finished");

        match failure {
            Some(message) => Err(ConvoyError::phase(name, phase, message)),
            None => Ok(()),
        }
    }
}

/// Resolves once `timeout` elapses; never resolves without one
async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

/// Resolves once a stop is requested
async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: a stop can no longer arrive
            std::future::pending::<()>().await;
        }
    }
}

/// Error text including its source chain
fn describe(error: &ConvoyError) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
