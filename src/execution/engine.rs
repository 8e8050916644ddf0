//! Pipeline Execution Engine
//!
//! The control loop that drives a run over an [`ExecutionGraph`]:
//! - Launches ready instances within the parallelism budget
//! - Streams child output to the reporting stream
//! - Polls the pause signal once per tick
//! - Samples resources of running processes
//! - Terminates every running child on abort
//!
//! All run state lives in one [`RunState`] owned by the loop. Workers and
//! the resource monitor only talk to it through channels.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::environment::EnvironmentResolver;
use crate::monitoring::{spawn_monitor, EventType, ExecutionTimeline, MonitorCommand};
use crate::report::Reporter;
use crate::workflow::ExecutionGraph;

use super::scheduler::{InstanceStatus, RunState, RunSummary, Transition};
use super::step::{prepare_launch, spawn_worker, WorkerEvent, ABORTED};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SAMPLE_CHANNEL_CAPACITY: usize = 256;

/// One launched instance and the command it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub instance: String,
    pub command: String,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Launch sequence in order
    pub launches: Vec<LaunchRecord>,
    pub timeline: ExecutionTimeline,
    /// Highest budget usage observed
    pub peak_parallelism: usize,
    pub aborted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// 0 on success, 130 after an abort, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.aborted {
            130
        } else if self.summary.is_success() {
            0
        } else {
            1
        }
    }
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use pipeline_engine::config::EngineConfig;
/// use pipeline_engine::environment::EnvironmentResolver;
/// use pipeline_engine::execution::Engine;
/// use pipeline_engine::report::Reporter;
/// use pipeline_engine::workflow::{load_pipeline, prepare_pipeline, WildcardBindings};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_pipeline("pipeline.yaml")?;
///     let graph = prepare_pipeline(definition, WildcardBindings::new())?;
///
///     let mut engine = Engine::new(
///         EngineConfig::default(),
///         EnvironmentResolver::ambient(),
///         Reporter::stdio(),
///     );
///     let report = engine.run(graph).await;
///     std::process::exit(report.exit_code() as i32);
/// }
/// ```
pub struct Engine {
    config: EngineConfig,
    resolver: EnvironmentResolver,
    reporter: Reporter,
}

impl Engine {
    pub fn new(config: EngineConfig, resolver: EnvironmentResolver, reporter: Reporter) -> Self {
        Self {
            config,
            resolver,
            reporter,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes the graph until it drains or Ctrl-C is pressed.
    pub async fn run(&mut self, graph: ExecutionGraph) -> RunReport {
        self.run_until(graph, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Interrupt handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Executes the graph until it drains or `abort` completes.
    ///
    /// On abort, running children are killed and reported as failed and
    /// every instance not yet started is skipped.
    pub async fn run_until<F>(&mut self, graph: ExecutionGraph, abort: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let config = &self.config;
        let resolver = &self.resolver;
        let reporter = &mut self.reporter;

        info!(
            "Starting execution of {} instance(s) (max parallel: {}, dry run: {})",
            graph.len(),
            config.max_parallel,
            config.dry_run
        );
        if config.dry_run {
            info!("Mode: DRY RUN (commands will not execute)");
        }
        if let Some(path) = config.pause.path() {
            info!("Pause control: {}", path.display());
        }

        let (event_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sample_tx, mut samples) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);

        let monitor = if config.dry_run {
            drop(sample_tx);
            None
        } else {
            Some(spawn_monitor(config.monitor_interval, sample_tx))
        };

        let mut run = Run {
            state: RunState::new(graph, config.max_parallel, config.failure_mode),
            timeline: ExecutionTimeline::new(),
            launches: Vec::new(),
            workers: Vec::new(),
            monitor: monitor.as_ref().map(|(commands, _)| commands.clone()),
            events: event_tx,
            shutdown: shutdown_rx,
            config,
            resolver,
            reporter,
        };

        let mut ticker = tokio::time::interval(run.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(abort);
        let mut aborted = false;

        loop {
            run.poll_pause();
            run.launch_ready();

            if run.state.is_drained() {
                break;
            }

            tokio::select! {
                Some(event) = events.recv() => run.handle_event(event),
                Some(sample) = samples.recv() => run.timeline.add_sample(sample),
                _ = ticker.tick() => {}
                _ = &mut abort, if !aborted => {
                    aborted = true;
                    let _ = shutdown_tx.send(true);
                    run.abort();
                }
            }
        }

        let Run {
            state,
            mut timeline,
            launches,
            workers,
            monitor: monitor_commands,
            reporter,
            ..
        } = run;

        // Workers still blocked on a full channel give up once it closes.
        drop(events);
        for worker in workers {
            let _ = worker.await;
        }

        drop(monitor_commands);
        if let Some((commands, handle)) = monitor {
            drop(commands);
            while let Ok(sample) = samples.try_recv() {
                timeline.add_sample(sample);
            }
            drop(samples);
            let _ = handle.await;
        }

        let summary = state.summary();
        let elapsed = started.elapsed();

        if !config.dry_run {
            info!("{}", timeline.resource_summary());
            info!("{}", timeline.gantt_chart());
        }
        reporter.summary(&summary, elapsed);

        RunReport {
            summary,
            launches,
            timeline,
            peak_parallelism: state.peak_in_use(),
            aborted,
            elapsed,
        }
    }
}

/// Per-run context of the control loop.
struct Run<'e> {
    state: RunState,
    timeline: ExecutionTimeline,
    launches: Vec<LaunchRecord>,
    workers: Vec<JoinHandle<()>>,
    monitor: Option<mpsc::UnboundedSender<MonitorCommand>>,
    events: mpsc::Sender<WorkerEvent>,
    shutdown: watch::Receiver<bool>,
    config: &'e EngineConfig,
    resolver: &'e EnvironmentResolver,
    reporter: &'e mut Reporter,
}

impl Run<'_> {
    fn id(&self, idx: usize) -> String {
        self.state.graph().instance(idx).id.clone()
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config.working_dir.clone()
    }

    fn poll_pause(&mut self) {
        let asserted = self.config.pause.is_asserted();
        if !self.state.set_paused(asserted) {
            return;
        }

        if asserted {
            info!("Execution paused - waiting for resume signal");
            self.timeline.add_run_event(EventType::Paused);
            self.reporter.paused(self.state.running_count());
        } else {
            info!("Resumed");
            self.timeline.add_run_event(EventType::Resumed);
            self.reporter.resumed();
        }
    }

    /// Launches (or, in dry-run, previews) everything the budget allows.
    fn launch_ready(&mut self) {
        loop {
            let batch = self.state.select_launchable();
            if batch.is_empty() {
                return;
            }

            for &idx in &batch {
                self.state.mark_running(idx);
            }
            for idx in batch {
                if self.config.dry_run {
                    self.preview(idx);
                } else {
                    self.launch(idx);
                }
            }
        }
    }

    fn preview(&mut self, idx: usize) {
        let id = self.id(idx);
        let prepared = prepare_launch(self.state.graph().instance(idx), self.resolver, None, true);

        match prepared {
            Ok(prepared) => {
                self.reporter.dry_run(self.state.graph().instance(idx), &prepared);
                self.launches.push(LaunchRecord {
                    instance: id.clone(),
                    command: prepared.resolved,
                });
                self.timeline.add_event(id.clone(), EventType::Started);
                self.timeline.add_event(id, EventType::Succeeded);
                self.state.mark_succeeded(idx);
            }
            Err(e) => self.fail(idx, e.to_string()),
        }
    }

    fn launch(&mut self, idx: usize) {
        let id = self.id(idx);
        let working_dir = self.working_dir();
        let prepared = prepare_launch(
            self.state.graph().instance(idx),
            self.resolver,
            working_dir.as_deref(),
            false,
        );

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail(idx, e.to_string());
                return;
            }
        };

        debug!("Launching '{}' via {}: {}", id, prepared.environment, prepared.command);
        self.reporter.started(&id, &prepared.resolved);
        self.timeline.add_event(id.clone(), EventType::Started);
        self.launches.push(LaunchRecord {
            instance: id,
            command: prepared.resolved,
        });

        self.workers.push(spawn_worker(
            idx,
            prepared.command,
            working_dir,
            self.events.clone(),
            self.shutdown.clone(),
        ));
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { idx, pid } => {
                if let (Some(pid), Some(monitor)) = (pid, &self.monitor) {
                    let _ = monitor.send(MonitorCommand::Track {
                        instance: self.id(idx),
                        pid,
                    });
                }
            }
            WorkerEvent::Output { idx, stream, line } => {
                let id = self.id(idx);
                self.reporter.output(&id, stream, &line);
            }
            WorkerEvent::Exited { idx, result } => {
                if *self.state.status(idx) != InstanceStatus::Running {
                    return;
                }
                let id = self.id(idx);
                if let Some(monitor) = &self.monitor {
                    let _ = monitor.send(MonitorCommand::Untrack(id.clone()));
                }

                match result {
                    Ok(()) => {
                        info!("Instance '{}' completed successfully", id);
                        self.state.mark_succeeded(idx);
                        self.timeline.add_event(id.clone(), EventType::Succeeded);
                        self.reporter.succeeded(&id);
                    }
                    Err(reason) => self.fail(idx, reason),
                }
            }
        }
    }

    /// Records a failure and reports everything it skipped.
    fn fail(&mut self, idx: usize, reason: String) {
        let id = self.id(idx);
        warn!("Instance '{}' failed: {}", id, reason);
        self.timeline.add_event(id.clone(), EventType::Failed);
        self.reporter.failed(&id, &reason);

        let Transition { skipped, .. } = self.state.mark_failed(idx, reason);
        self.report_skipped(&skipped);
    }

    fn report_skipped(&mut self, skipped: &[usize]) {
        for &idx in skipped {
            let id = self.id(idx);
            if let InstanceStatus::Skipped { cause } = self.state.status(idx) {
                self.reporter.skipped(&id, cause);
            }
            self.timeline.add_event(id, EventType::Skipped);
        }
    }

    /// Fails running instances and skips the rest. The caller has already
    /// told the workers to kill their children.
    fn abort(&mut self) {
        warn!("Run aborted");
        self.reporter.aborting(self.state.running_count());

        let waiting: Vec<usize> = (0..self.state.graph().len())
            .filter(|&idx| {
                matches!(
                    self.state.status(idx),
                    InstanceStatus::Pending | InstanceStatus::Ready
                )
            })
            .collect();

        for idx in self.state.abort(ABORTED) {
            let id = self.id(idx);
            self.timeline.add_event(id.clone(), EventType::Failed);
            self.reporter.failed(&id, ABORTED);
        }
        self.report_skipped(&waiting);
    }
}
