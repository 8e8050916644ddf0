//! Run State and Scheduling
//!
//! Tracks every instance's status and the parallelism budget, and decides
//! which ready instances to launch next. Owned and mutated exclusively by
//! the engine's control loop; nothing here is async.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;

use crate::workflow::ExecutionGraph;

/// Lifecycle of a single step instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InstanceStatus {
    /// Waiting for predecessors
    Pending,
    /// All predecessors succeeded
    Ready,
    Running,
    Succeeded,
    /// Non-zero exit, launch error or abort
    Failed(String),
    /// Not attempted; `cause` says why
    Skipped { cause: String },
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed(_) | Self::Skipped { .. }
        )
    }
}

/// What happens to the rest of the run after an instance fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Skip only the failed instance's downstream cone
    #[default]
    Isolate,
    /// Stop launching altogether; running instances still finish
    FailFast,
}

/// State changes caused by one completion.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Instances promoted to Ready
    pub promoted: Vec<usize>,
    /// Instances marked Skipped
    pub skipped: Vec<usize>,
}

/// Final outcome counts and the reasons behind every non-success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: Vec<String>,
    /// `(instance, reason)`
    pub failed: Vec<(String, String)>,
    /// `(instance, cause)`
    pub skipped: Vec<(String, String)>,
}

impl RunSummary {
    /// True iff nothing failed and nothing was skipped.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len()
        )
    }
}

/// Per-run scheduling state over an [`ExecutionGraph`].
#[derive(Debug)]
pub struct RunState {
    graph: ExecutionGraph,
    statuses: Vec<InstanceStatus>,
    remaining_deps: Vec<usize>,
    budget: usize,
    in_use: usize,
    in_flight: BTreeSet<usize>,
    paused: bool,
    failure_mode: FailureMode,
    halted: bool,
    launches: Vec<usize>,
    peak_in_use: usize,
}

impl RunState {
    /// Creates the run state; instances without predecessors start Ready.
    pub fn new(graph: ExecutionGraph, budget: usize, failure_mode: FailureMode) -> Self {
        let remaining_deps: Vec<usize> = (0..graph.len())
            .map(|i| graph.predecessors(i).len())
            .collect();
        let statuses = remaining_deps
            .iter()
            .map(|&deps| {
                if deps == 0 {
                    InstanceStatus::Ready
                } else {
                    InstanceStatus::Pending
                }
            })
            .collect();

        let budget = budget.max(1);
        for instance in graph.instances() {
            if instance.threads > budget {
                warn!(
                    "Instance '{}' claims {} threads, more than the budget of {}; it will run alone",
                    instance.id,
                    instance.threads,
                    budget
                );
            }
        }

        Self {
            graph,
            statuses,
            remaining_deps,
            budget,
            in_use: 0,
            in_flight: BTreeSet::new(),
            paused: false,
            failure_mode,
            halted: false,
            launches: Vec::new(),
            peak_in_use: 0,
        }
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn status(&self, idx: usize) -> &InstanceStatus {
        &self.statuses[idx]
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use
    }

    pub fn running(&self) -> impl Iterator<Item = usize> + '_ {
        self.in_flight.iter().copied()
    }

    pub fn running_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Instance indices in launch order.
    pub fn launches(&self) -> &[usize] {
        &self.launches
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Updates the pause flag; returns true when it changed.
    pub fn set_paused(&mut self, paused: bool) -> bool {
        let changed = self.paused != paused;
        self.paused = paused;
        changed
    }

    fn claim(&self, idx: usize) -> usize {
        self.graph.instance(idx).threads.max(1)
    }

    /// Ready instances to launch now, in index order.
    ///
    /// Normal claims are packed greedily, so a small instance further down may
    /// back-fill budget a larger one cannot use. A claim larger than the whole
    /// budget runs alone once nothing else is running; until then it blocks
    /// every instance after it.
    pub fn select_launchable(&self) -> Vec<usize> {
        if self.paused || self.halted {
            return Vec::new();
        }

        let mut selected = Vec::new();
        let mut remaining = self.budget.saturating_sub(self.in_use);

        for idx in (0..self.statuses.len()).filter(|&i| self.statuses[i] == InstanceStatus::Ready) {
            let claim = self.claim(idx);

            if claim > self.budget {
                if self.in_use == 0 && selected.is_empty() {
                    selected.push(idx);
                }
                break;
            }

            if claim <= remaining {
                selected.push(idx);
                remaining -= claim;
            }

            if remaining == 0 {
                break;
            }
        }

        selected
    }

    /// Moves a Ready instance to Running and takes its claim from the budget.
    pub fn mark_running(&mut self, idx: usize) {
        debug_assert_eq!(self.statuses[idx], InstanceStatus::Ready);

        let claim = self.claim(idx);
        self.statuses[idx] = InstanceStatus::Running;
        self.in_flight.insert(idx);
        self.in_use += claim;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        self.launches.push(idx);

        debug!(
            "Instance '{}' started using {} threads (total: {}/{})",
            self.graph.instance(idx).id,
            claim,
            self.in_use,
            self.budget
        );
    }

    fn release(&mut self, idx: usize) {
        if self.in_flight.remove(&idx) {
            self.in_use = self.in_use.saturating_sub(self.claim(idx));
        }
    }

    /// Records a successful exit and promotes successors whose predecessors
    /// have all succeeded.
    pub fn mark_succeeded(&mut self, idx: usize) -> Transition {
        self.release(idx);
        self.statuses[idx] = InstanceStatus::Succeeded;

        let mut transition = Transition::default();
        for &next in self.graph.successors(idx) {
            self.remaining_deps[next] = self.remaining_deps[next].saturating_sub(1);
            if self.remaining_deps[next] == 0 && self.statuses[next] == InstanceStatus::Pending {
                self.statuses[next] = InstanceStatus::Ready;
                transition.promoted.push(next);
            }
        }
        transition
    }

    /// Records a failure and skips everything it makes unreachable.
    ///
    /// The downstream cone is always skipped; in fail-fast mode every
    /// not-yet-started instance is skipped as well.
    pub fn mark_failed(&mut self, idx: usize, reason: impl Into<String>) -> Transition {
        self.release(idx);
        self.statuses[idx] = InstanceStatus::Failed(reason.into());

        let failed_id = self.graph.instance(idx).id.clone();
        let cause = format!("upstream '{}' failed", failed_id);
        let targets: Vec<usize> = match self.failure_mode {
            FailureMode::Isolate => self.graph.downstream(idx),
            FailureMode::FailFast => {
                self.halted = true;
                (0..self.statuses.len()).collect()
            }
        };

        let mut transition = Transition::default();
        for target in targets {
            if matches!(
                self.statuses[target],
                InstanceStatus::Pending | InstanceStatus::Ready
            ) {
                self.statuses[target] = InstanceStatus::Skipped {
                    cause: cause.clone(),
                };
                transition.skipped.push(target);
            }
        }

        if !transition.skipped.is_empty() {
            info!(
                "Skipping {} instance(s) after '{}' failed",
                transition.skipped.len(),
                failed_id
            );
        }
        transition
    }

    /// Ends the run early: running instances become Failed with `reason`,
    /// everything not started becomes Skipped. Returns the indices of the
    /// instances that were running.
    pub fn abort(&mut self, reason: &str) -> Vec<usize> {
        let cause = format!("run {}", reason);
        self.halted = true;
        let running: Vec<usize> = self.in_flight.iter().copied().collect();

        for &idx in &running {
            self.statuses[idx] = InstanceStatus::Failed(reason.to_string());
        }
        self.in_flight.clear();
        self.in_use = 0;

        for status in &mut self.statuses {
            if matches!(status, InstanceStatus::Pending | InstanceStatus::Ready) {
                *status = InstanceStatus::Skipped {
                    cause: cause.clone(),
                };
            }
        }
        running
    }

    /// True when no instance is Pending, Ready or Running.
    pub fn is_drained(&self) -> bool {
        self.statuses.iter().all(InstanceStatus::is_terminal)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for (idx, status) in self.statuses.iter().enumerate() {
            let id = self.graph.instance(idx).id.clone();
            match status {
                InstanceStatus::Succeeded => summary.succeeded.push(id),
                InstanceStatus::Failed(reason) => summary.failed.push((id, reason.clone())),
                InstanceStatus::Skipped { cause } => summary.skipped.push((id, cause.clone())),
                _ => {}
            }
        }
        summary
    }
}
