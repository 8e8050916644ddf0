//! Pipeline Execution Module
//!
//! Runs an execution graph: scheduling within the parallelism budget,
//! process launch and output streaming, pause/resume and abort.
//!
//! # Architecture
//!
//! - [`engine`]: async control loop orchestrating a run
//! - [`scheduler`]: run state machine and launch selection
//! - [`step`]: command resolution and process workers
//! - [`pause`]: file-based pause signal

pub mod engine;
pub mod pause;
pub mod scheduler;
pub mod step;

pub use engine::{Engine, LaunchRecord, RunReport};
pub use pause::PauseSignal;
pub use scheduler::{FailureMode, InstanceStatus, RunState, RunSummary};
pub use step::{prepare_launch, resolve_command, OutputStream, PreparedLaunch, WorkerEvent};
