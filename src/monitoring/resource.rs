//! Resource Usage Monitoring
//!
//! Samples CPU and memory of running step processes. Usage is summed over
//! each instance's whole process tree, since step commands run under a
//! shell (and possibly a micromamba launcher).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default interval between resource samples.
pub const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// One resource reading for one running instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub instance: String,
    /// CPU usage percentage (can exceed 100 on multiple cores)
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Tracks the root processes of running instances and samples them.
///
/// # Example
///
/// ```rust,no_run
/// use pipeline_engine::monitoring::ResourceMonitor;
///
/// let mut monitor = ResourceMonitor::new();
/// monitor.track("align_s1", 4242);
/// monitor.sample(); // warmup
/// for sample in monitor.sample() {
///     println!("{} {:.1}%", sample.instance, sample.cpu_percent);
/// }
/// ```
pub struct ResourceMonitor {
    system: System,
    tracked: BTreeMap<String, Pid>,
    warmup_done: bool,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            tracked: BTreeMap::new(),
            warmup_done: false,
        }
    }

    /// Starts monitoring the process tree rooted at `pid`.
    pub fn track(&mut self, instance: impl Into<String>, pid: u32) {
        self.tracked.insert(instance.into(), Pid::from_u32(pid));
    }

    pub fn untrack(&mut self, instance: &str) {
        self.tracked.remove(instance);
    }

    pub fn is_idle(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Refreshes process data and returns one sample per live instance.
    ///
    /// The first call only primes CPU accounting and returns nothing.
    /// Instances whose root process is already gone are dropped silently.
    pub fn sample(&mut self) -> Vec<ResourceSample> {
        self.system
            .refresh_processes_specifics(ProcessRefreshKind::new().with_cpu().with_memory());

        if !self.warmup_done {
            self.warmup_done = true;
            return Vec::new();
        }

        let children = children_of(&self.system);
        let timestamp = Utc::now();
        let mut samples = Vec::with_capacity(self.tracked.len());

        for (instance, root) in &self.tracked {
            if self.system.process(*root).is_none() {
                debug!("Process for '{}' already gone; sample dropped", instance);
                continue;
            }

            let mut cpu_percent = 0.0;
            let mut memory_bytes = 0;
            for pid in process_tree(&children, *root) {
                if let Some(process) = self.system.process(pid) {
                    cpu_percent += process.cpu_usage();
                    memory_bytes += process.memory();
                }
            }

            samples.push(ResourceSample {
                timestamp,
                instance: instance.clone(),
                cpu_percent,
                memory_bytes,
            });
        }

        samples
    }
}

fn children_of(system: &System) -> HashMap<Pid, Vec<Pid>> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    children
}

/// `root` and all its descendants, breadth first.
fn process_tree(children: &HashMap<Pid, Vec<Pid>>, root: Pid) -> Vec<Pid> {
    let mut tree = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        tree.push(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    tree
}

/// Kills `pid` and every process descended from it.
///
/// The tree is snapshotted first and the root is killed before its
/// descendants, so it cannot start new ones. Returns the number of
/// processes signalled. Blocking.
pub fn kill_process_tree(pid: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let tree = process_tree(&children_of(&system), Pid::from_u32(pid));
    tree.into_iter()
        .filter_map(|pid| system.process(pid))
        .filter(|process| process.kill())
        .count()
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests from the control loop to the monitor task.
#[derive(Debug)]
pub enum MonitorCommand {
    Track { instance: String, pid: u32 },
    Untrack(String),
}

/// Runs a [`ResourceMonitor`] on its own task.
///
/// Samples are taken every `interval` while anything is tracked, on the
/// blocking pool, and forwarded to `samples`. The task ends when the command
/// sender is dropped or the sample receiver is closed.
pub fn spawn_monitor(
    interval: Duration,
    samples: mpsc::Sender<ResourceSample>,
) -> (mpsc::UnboundedSender<MonitorCommand>, JoinHandle<()>) {
    let (command_tx, mut commands) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut monitor = ResourceMonitor::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Track { instance, pid }) => monitor.track(instance, pid),
                    Some(MonitorCommand::Untrack(instance)) => monitor.untrack(&instance),
                    None => break,
                },
                _ = ticker.tick() => {
                    if monitor.is_idle() {
                        continue;
                    }

                    let mut owned = std::mem::take(&mut monitor);
                    let batch = match tokio::task::spawn_blocking(move || {
                        let batch = owned.sample();
                        (owned, batch)
                    })
                    .await
                    {
                        Ok((returned, batch)) => {
                            monitor = returned;
                            batch
                        }
                        Err(e) => {
                            warn!("Resource sampling stopped: {}", e);
                            break;
                        }
                    };

                    for sample in batch {
                        if samples.send(sample).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    (command_tx, handle)
}
