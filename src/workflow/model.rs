//! Pipeline Data Model
//!
//! Author-time step templates, wildcard bindings, and the concrete step
//! instances the engine schedules.
//!
//! # Example YAML Format
//!
//! ```yaml
//! wildcards:
//!   sample: [s1, s2]
//!
//! steps:
//!   - id: quality_control
//!     tool: fastqc
//!     command: fastqc {input} -o {output}
//!     input: [raw/{sample}.fastq]
//!     output: [qc/{sample}/]
//!     threads: 2
//!
//!   - id: summary
//!     tool: multiqc
//!     command: multiqc qc -o {output}
//!     output: [report/]
//!     previous: [quality_control]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Placeholder names substituted from an instance's own paths, never wildcards.
pub const RESERVED_PLACEHOLDERS: &[&str] = &["input", "output", "inputs", "outputs"];

/// One author-defined unit of work, before wildcard expansion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepTemplate {
    /// Unique identifier for this step
    pub id: String,

    /// Tool name, used to look up an isolated environment
    pub tool: String,

    /// Command template with `{input}`/`{output}` placeholders
    pub command: String,

    #[serde(default)]
    pub input: Vec<String>,

    #[serde(default)]
    pub output: Vec<String>,

    /// IDs of steps that must succeed before this one starts
    #[serde(default)]
    pub previous: Vec<String>,

    /// IDs of steps that wait on this one
    #[serde(default)]
    pub next: Vec<String>,

    /// Share of the global parallelism budget held while running
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Editor color, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// Batch files per wildcard name; values are derived from the file names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wildcard_files: BTreeMap<String, Vec<String>>,
}

fn default_threads() -> usize {
    1
}

impl StepTemplate {
    /// Creates a step template with no paths or dependencies.
    ///
    /// ```
    /// use pipeline_engine::workflow::StepTemplate;
    ///
    /// let step = StepTemplate::new("align", "bowtie2", "bowtie2 -x ref {input} > {output}")
    ///     .with_input("reads/{sample}.fastq")
    ///     .with_output("aligned/{sample}.sam")
    ///     .with_threads(4);
    /// assert_eq!(step.threads, 4);
    /// ```
    pub fn new(id: impl Into<String>, tool: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            tool: tool.into().trim().to_string(),
            command: command.into().trim().to_string(),
            input: Vec::new(),
            output: Vec::new(),
            previous: Vec::new(),
            next: Vec::new(),
            threads: 1,
            color: None,
            wildcard_files: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input.push(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output.push(output.into());
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.previous.push(step_id.into());
        self
    }

    /// Declares that another step waits on this one.
    pub fn followed_by(mut self, step_id: impl Into<String>) -> Self {
        self.next.push(step_id.into());
        self
    }

    /// Wildcard names appearing in this step's input/output paths, sorted.
    pub fn wildcard_names(&self) -> Vec<String> {
        use crate::workflow::wildcards::extract_wildcard_names;

        let mut names: Vec<String> = self
            .input
            .iter()
            .chain(self.output.iter())
            .flat_map(|path| extract_wildcard_names(path))
            .filter(|name| !RESERVED_PLACEHOLDERS.contains(&name.as_str()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// True when this step declares explicit edges.
    pub fn has_explicit_edges(&self) -> bool {
        !self.previous.is_empty() || !self.next.is_empty()
    }
}

/// Wildcard name to an ordered, duplicate-free list of values.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct WildcardBindings {
    values: BTreeMap<String, Vec<String>>,
}

impl WildcardBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends values under `name`, skipping any already bound.
    pub fn extend(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = String>) {
        let bound = self.values.entry(name.into()).or_default();
        for value in values {
            if !bound.contains(&value) {
                bound.push(value);
            }
        }
    }

    /// Merges another set of bindings into this one, name by name.
    pub fn merge(&mut self, other: WildcardBindings) {
        for (name, values) in other.values {
            self.extend(name, values);
        }
    }

    /// Bound values for `name`; `None` when the name is unbound or empty.
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.values
            .get(name)
            .map(Vec::as_slice)
            .filter(|values| !values.is_empty())
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.values(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(Vec::is_empty)
    }
}

impl From<BTreeMap<String, Vec<String>>> for WildcardBindings {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut bindings = Self::new();
        for (name, values) in map {
            bindings.extend(name, values);
        }
        bindings
    }
}

impl From<WildcardBindings> for BTreeMap<String, Vec<String>> {
    fn from(bindings: WildcardBindings) -> Self {
        bindings.values
    }
}

/// A complete pipeline definition as written by the editor.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub steps: Vec<StepTemplate>,

    #[serde(default, skip_serializing_if = "WildcardBindings::is_empty")]
    pub wildcards: WildcardBindings,
}

impl PipelineDefinition {
    pub fn from_steps(steps: Vec<StepTemplate>) -> Self {
        Self {
            steps,
            wildcards: WildcardBindings::new(),
        }
    }

    pub fn with_wildcards(mut self, wildcards: WildcardBindings) -> Self {
        self.wildcards = wildcards;
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Unique tool names in declaration order.
    pub fn tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = Vec::new();
        for step in &self.steps {
            if !tools.contains(&step.tool) {
                tools.push(step.tool.clone());
            }
        }
        tools
    }
}

/// The wildcard value an instance was expanded for.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WildcardValue {
    pub name: String,
    pub value: String,
}

/// A concrete, schedulable unit of work derived from a [`StepTemplate`].
///
/// `previous`/`next` hold raw instance IDs; the graph builder resolves them.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepInstance {
    pub id: String,
    /// ID of the originating template
    pub template: String,
    pub tool: String,
    pub command: String,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub previous: Vec<String>,
    pub next: Vec<String>,
    pub threads: usize,
    pub wildcard: Option<WildcardValue>,
}

impl StepInstance {
    /// Single, unexpanded instance of a template.
    pub fn from_template(template: &StepTemplate) -> Self {
        Self {
            id: template.id.clone(),
            template: template.id.clone(),
            tool: template.tool.clone(),
            command: template.command.clone(),
            input: template.input.clone(),
            output: template.output.clone(),
            previous: Vec::new(),
            next: Vec::new(),
            threads: template.threads,
            wildcard: None,
        }
    }

    /// Output paths joined onto `base` when they are relative.
    pub fn output_paths(&self, base: Option<&Path>) -> Vec<std::path::PathBuf> {
        self.output
            .iter()
            .filter(|o| !o.trim().is_empty())
            .map(|o| match base {
                Some(dir) => dir.join(o),
                None => Path::new(o).to_path_buf(),
            })
            .collect()
    }
}
