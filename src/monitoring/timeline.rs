//! Execution Timeline
//!
//! Records lifecycle events and resource samples of a run, for the end-of-run
//! report, the Gantt chart and the optional JSON export.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;

use super::resource::ResourceSample;

const CHART_WIDTH: f64 = 50.0;
const LABEL_WIDTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Started,
    Succeeded,
    Failed,
    Skipped,
    /// Run-level: the pause signal was observed
    Paused,
    /// Run-level: the pause signal cleared
    Resumed,
}

impl EventType {
    fn ends_instance(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    /// `None` for run-level events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTimeline {
    start_time: DateTime<Utc>,
    events: Vec<TimelineEvent>,
    samples: Vec<ResourceSample>,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            events: Vec::new(),
            samples: Vec::new(),
        }
    }

    fn record(&mut self, instance: Option<String>, event_type: EventType, timestamp: DateTime<Utc>) {
        self.events.push(TimelineEvent {
            instance,
            event_type,
            timestamp,
        });
    }

    pub fn add_event(&mut self, instance: impl Into<String>, event_type: EventType) {
        self.record(Some(instance.into()), event_type, Utc::now());
    }

    /// Records a run-level event such as a pause.
    pub fn add_run_event(&mut self, event_type: EventType) {
        self.record(None, event_type, Utc::now());
    }

    pub fn add_sample(&mut self, sample: ResourceSample) {
        self.samples.push(sample);
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    /// `(start, end)` offsets in milliseconds for every instance that finished.
    fn spans(&self) -> Vec<(String, i64, i64)> {
        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let Some(instance) = event.instance.as_deref() else {
                continue;
            };
            let offset = (event.timestamp - self.start_time).num_milliseconds();

            if event.event_type == EventType::Started {
                starts.insert(instance, offset);
            } else if event.event_type.ends_instance() {
                if let Some(start) = starts.remove(instance) {
                    spans.push((instance.to_string(), start, offset));
                }
            }
        }

        spans.sort_by_key(|(_, start, _)| *start);
        spans
    }

    /// Run duration in milliseconds per finished instance.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .map(|(id, start, end)| (id, end - start))
            .collect()
    }

    /// ASCII Gantt chart: one bar per finished instance, scaled to the run.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_ms = self.elapsed().num_milliseconds();
        if total_ms <= 0 {
            return output;
        }
        let scale = CHART_WIDTH / total_ms as f64;

        for (id, start, end) in self.spans() {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64 * scale).max(1.0)) as usize;

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                truncate(&id, LABEL_WIDTH),
                " ".repeat(start_pos),
                "#".repeat(width),
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }

    /// Human-readable summary of the resource samples.
    pub fn resource_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let avg_cpu =
            self.samples.iter().map(|s| s.cpu_percent).sum::<f32>() / self.samples.len() as f32;
        let peak_memory = self.samples.iter().map(|s| s.memory_bytes).max().unwrap_or(0);

        let mut per_instance: BTreeMap<&str, u64> = BTreeMap::new();
        for sample in &self.samples {
            let peak = per_instance.entry(sample.instance.as_str()).or_default();
            *peak = (*peak).max(sample.memory_bytes);
        }

        let mut summary = format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Samples: {}",
            avg_cpu,
            peak_memory / (1024 * 1024),
            self.samples.len()
        );
        for (instance, peak) in per_instance {
            summary.push_str(&format!("\n    {}: {} MB peak", instance, peak / (1024 * 1024)));
        }
        summary
    }

    /// Writes the timeline as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| EngineError::Timeline {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let kept: String = s.chars().take(width - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn at(timeline: &ExecutionTimeline, ms: i64) -> DateTime<Utc> {
        timeline.start_time + Duration::milliseconds(ms)
    }

    fn sample(instance: &str, cpu: f32, mb: u64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now(),
            instance: instance.to_string(),
            cpu_percent: cpu,
            memory_bytes: mb * 1024 * 1024,
        }
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events().is_empty());
        assert!(timeline.samples().is_empty());
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        let (start, end) = (at(&timeline, 10), at(&timeline, 60));
        timeline.record(Some("a".into()), EventType::Started, start);
        timeline.record(Some("a".into()), EventType::Succeeded, end);

        assert_eq!(timeline.get_durations().get("a"), Some(&50));
    }

    #[test]
    fn test_failed_event_closes_span() {
        let mut timeline = ExecutionTimeline::new();
        let (start, end) = (at(&timeline, 0), at(&timeline, 20));
        timeline.record(Some("a".into()), EventType::Started, start);
        timeline.record(Some("a".into()), EventType::Failed, end);

        assert_eq!(timeline.get_durations().get("a"), Some(&20));
    }

    #[test]
    fn test_skipped_and_run_events_have_no_span() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("c", EventType::Skipped);
        timeline.add_run_event(EventType::Paused);
        timeline.add_run_event(EventType::Resumed);
        timeline.add_event("d", EventType::Started);

        assert!(timeline.get_durations().is_empty());
        assert_eq!(timeline.events().len(), 4);
        assert!(timeline.events()[1].instance.is_none());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.start_time = Utc::now() - Duration::milliseconds(200);
        for (id, s, e) in [("step1", 0, 80), ("step2", 80, 160)] {
            let (start, end) = (at(&timeline, s), at(&timeline, e));
            timeline.record(Some(id.into()), EventType::Started, start);
            timeline.record(Some(id.into()), EventType::Succeeded, end);
        }

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("(80 ms)"));
        assert!(chart.contains("Total:"));
        assert!(chart.find("step1") < chart.find("step2"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
    }

    #[test]
    fn test_resource_summary() {
        let mut timeline = ExecutionTimeline::new();
        assert!(timeline.resource_summary().contains("No resource data"));

        timeline.add_sample(sample("a", 50.0, 10));
        timeline.add_sample(sample("a", 150.0, 30));
        timeline.add_sample(sample("b", 100.0, 20));

        let summary = timeline.resource_summary();
        assert!(summary.contains("Average CPU: 100.0%"));
        assert!(summary.contains("Peak Memory: 30 MB"));
        assert!(summary.contains("a: 30 MB peak"));
        assert!(summary.contains("Samples: 3"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timeline.json");

        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a", EventType::Started);
        timeline.add_run_event(EventType::Paused);
        timeline.add_sample(sample("a", 1.0, 1));
        timeline.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["events"][0]["instance"], "a");
        assert_eq!(value["events"][0]["event_type"], "Started");
        assert!(value["events"][1].get("instance").is_none());
        assert_eq!(value["samples"][0]["memory_bytes"], 1024 * 1024);
    }

    #[test]
    fn test_write_json_bad_path() {
        let timeline = ExecutionTimeline::new();
        let result = timeline.write_json(Path::new("/nonexistent/dir/timeline.json"));
        assert!(matches!(result, Err(EngineError::Timeline { .. })));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_very_long_instance", 8), "a_ver...");
    }
}
