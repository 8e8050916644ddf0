//! Resource Monitoring Module
//!
//! Tracks resource usage of running step processes and the execution
//! timeline of a run.
//!
//! # Components
//!
//! - [`ResourceMonitor`]: per-instance CPU and memory sampling
//! - [`ExecutionTimeline`]: lifecycle events, samples and Gantt charts

pub mod resource;
pub mod timeline;

pub use resource::{
    kill_process_tree, spawn_monitor, MonitorCommand, ResourceMonitor, ResourceSample,
};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
