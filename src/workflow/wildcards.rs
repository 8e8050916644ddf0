//! Wildcard Detection and Expansion
//!
//! - Derives wildcard values from batch file names
//! - Expands `{sample}`-style templates into one instance per bound value
//! - Links expanded instances to their same-value predecessors

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};

use super::model::{
    StepInstance, StepTemplate, WildcardBindings, WildcardValue, RESERVED_PLACEHOLDERS,
};

/// Extracts wildcard values from a list of file paths.
///
/// The directory is always dropped; the extension is dropped too when every
/// file that has one shares it. Files without an extension do not count.
///
/// # Example
/// ```
/// use pipeline_engine::workflow::wildcards::extract_wildcard_values;
///
/// let files = vec!["reads/s1.fastq".to_string(), "reads/s2.fastq".to_string()];
/// assert_eq!(extract_wildcard_values(&files), vec!["s1", "s2"]);
/// ```
pub fn extract_wildcard_values(files: &[String]) -> Vec<String> {
    let extensions: Vec<&str> = files
        .iter()
        .filter_map(|f| Path::new(f).extension().and_then(|e| e.to_str()))
        .collect();

    let common_ext = !extensions.is_empty() && extensions.windows(2).all(|w| w[0] == w[1]);

    files
        .iter()
        .map(|file| {
            let path = Path::new(file);
            let part = if common_ext {
                path.file_stem()
            } else {
                path.file_name()
            };
            part.and_then(|s| s.to_str()).unwrap_or(file).to_string()
        })
        .collect()
}

/// Extracts `{name}` tokens from a pattern, in order of appearance.
///
/// # Example
/// ```
/// use pipeline_engine::workflow::wildcards::extract_wildcard_names;
///
/// assert_eq!(extract_wildcard_names("reads/{sample}.fastq"), vec!["sample"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut current: Option<String> = None;

    for ch in pattern.chars() {
        match ch {
            '{' => current = Some(String::new()),
            '}' => {
                if let Some(name) = current.take().filter(|n| is_token_name(n)) {
                    names.push(name);
                }
            }
            _ => {
                if let Some(name) = current.as_mut() {
                    name.push(ch);
                }
            }
        }
    }

    names
}

fn is_token_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// Wildcard tokens still present in `text` after expansion.
///
/// Shell parameter expansions (`${HOME}`) and the `{input}`/`{output}`
/// placeholders are not wildcard tokens.
pub fn unresolved_tokens(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        let is_shell_expansion = rest[..open].ends_with('$');
        let after = &rest[open + 1..];

        match after.find(|c| c == '{' || c == '}') {
            Some(close) if after[close..].starts_with('}') => {
                let name = &after[..close];
                if !is_shell_expansion
                    && is_token_name(name)
                    && !RESERVED_PLACEHOLDERS.contains(&name)
                {
                    names.push(name.to_string());
                }
                rest = &after[close + 1..];
            }
            Some(close) => rest = &after[close..],
            None => break,
        }
    }

    names
}

/// Replaces every `{name}` token in `text` with `value`.
pub fn substitute_wildcard(text: &str, name: &str, value: &str) -> String {
    text.replace(&format!("{{{}}}", name), value)
}

/// Collects bindings from every step's `wildcard_files`.
pub fn bindings_from_files(steps: &[StepTemplate]) -> WildcardBindings {
    let mut bindings = WildcardBindings::new();
    for step in steps {
        for (name, files) in &step.wildcard_files {
            bindings.extend(name.clone(), extract_wildcard_values(files));
        }
    }
    bindings
}

/// The wildcard a template expands on, if any of its names is bound.
///
/// Validation guarantees at most one bound name per template.
pub fn expansion_name(step: &StepTemplate, bindings: &WildcardBindings) -> Option<String> {
    step.wildcard_names()
        .into_iter()
        .find(|name| bindings.is_bound(name))
}

/// ID of the instance expanded from `template` for `value`.
pub fn instance_id(template: &str, value: &str) -> String {
    format!("{}_{}", template, value)
}

struct Expansion<'a> {
    name: Option<String>,
    values: &'a [String],
}

impl Expansion<'_> {
    fn instance_ids(&self, template: &str) -> Vec<String> {
        match self.name {
            Some(_) => self.values.iter().map(|v| instance_id(template, v)).collect(),
            None => vec![template.to_string()],
        }
    }
}

/// Expands templates into step instances.
///
/// Instances come out in template declaration order, then wildcard-value
/// order; the scheduler relies on this ordering for its tie-break.
///
/// Edge linking: a reference to a template expanded on the same wildcard
/// binds to the instance with the same value; any other reference binds to
/// every instance of the referenced template. References to unknown templates
/// are carried through verbatim for the graph builder to reject.
pub fn expand_instances(steps: &[StepTemplate], bindings: &WildcardBindings) -> Vec<StepInstance> {
    const NO_VALUES: &[String] = &[];

    let expansions: HashMap<&str, Expansion> = steps
        .iter()
        .map(|step| {
            let name = expansion_name(step, bindings);
            let values = name
                .as_deref()
                .and_then(|n| bindings.values(n))
                .unwrap_or(NO_VALUES);
            (step.id.as_str(), Expansion { name, values })
        })
        .collect();

    let link = |refs: &[String], own: Option<&WildcardValue>| -> Vec<String> {
        let mut linked = Vec::new();
        for reference in refs {
            let Some(target) = expansions.get(reference.as_str()) else {
                linked.push(reference.clone());
                continue;
            };
            match (&target.name, own) {
                (Some(target_name), Some(own)) if *target_name == own.name => {
                    linked.push(instance_id(reference, &own.value));
                }
                _ => linked.extend(target.instance_ids(reference)),
            }
        }
        linked
    };

    let mut instances = Vec::new();

    for step in steps {
        let expansion = &expansions[step.id.as_str()];

        let Some(name) = &expansion.name else {
            let mut instance = StepInstance::from_template(step);
            instance.previous = link(&step.previous, None);
            instance.next = link(&step.next, None);
            instances.push(instance);
            continue;
        };

        info!(
            "Expanding step '{}' with wildcard '{{{}}}' into {} instances",
            step.id,
            name,
            expansion.values.len()
        );

        for value in expansion.values {
            let wildcard = WildcardValue {
                name: name.clone(),
                value: value.clone(),
            };
            let mut instance = StepInstance::from_template(step);
            instance.id = instance_id(&step.id, value);
            instance.command = substitute_wildcard(&step.command, name, value);
            instance.input = step
                .input
                .iter()
                .map(|p| substitute_wildcard(p, name, value))
                .collect();
            instance.output = step
                .output
                .iter()
                .map(|p| substitute_wildcard(p, name, value))
                .collect();
            instance.previous = link(&step.previous, Some(&wildcard));
            instance.next = link(&step.next, Some(&wildcard));
            instance.wildcard = Some(wildcard);

            debug!(
                "  Created '{}' with input={:?}, output={:?}",
                instance.id, instance.input, instance.output
            );
            instances.push(instance);
        }
    }

    info!(
        "Wildcard expansion: {} steps -> {} instances",
        steps.len(),
        instances.len()
    );
    instances
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_bindings(values: &[&str]) -> WildcardBindings {
        BTreeMap::from([(
            "sample".to_string(),
            values.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
        )])
        .into()
    }

    #[test]
    fn test_extract_wildcard_values() {
        let files = vec![
            "sample1.fastq".to_string(),
            "sample2.fastq".to_string(),
            "sample3.fastq".to_string(),
        ];

        let values = extract_wildcard_values(&files);
        assert_eq!(values, vec!["sample1", "sample2", "sample3"]);
    }

    #[test]
    fn test_extract_wildcard_values_mixed_extensions_keep_name() {
        let files = vec!["data/a.fastq".to_string(), "data/b.fq".to_string()];
        assert_eq!(extract_wildcard_values(&files), vec!["a.fastq", "b.fq"]);
    }

    #[test]
    fn test_extract_wildcard_values_ignores_files_without_extension() {
        let files = vec!["reads/a.fq".to_string(), "reads/b".to_string()];
        assert_eq!(extract_wildcard_values(&files), vec!["a", "b"]);
    }

    #[test]
    fn test_extract_wildcard_values_empty() {
        assert!(extract_wildcard_values(&[]).is_empty());
    }

    #[test]
    fn test_extract_wildcard_names() {
        assert_eq!(extract_wildcard_names("reads/{sample}.fastq"), vec!["sample"]);
        assert_eq!(
            extract_wildcard_names("{id}_{replicate}.txt"),
            vec!["id", "replicate"]
        );
        assert!(extract_wildcard_names("regular_file.txt").is_empty());
        assert!(extract_wildcard_names("awk '{print $1}'").is_empty());
    }

    #[test]
    fn test_unresolved_tokens() {
        assert_eq!(unresolved_tokens("cat {sample}.fq > {output}"), vec!["sample"]);
        assert!(unresolved_tokens("echo ${HOME} {input}").is_empty());
        assert!(unresolved_tokens("awk '{print $1}' {inputs}").is_empty());
        assert!(unresolved_tokens("cp {a,b}.txt out/").is_empty());
        assert_eq!(unresolved_tokens("{{lane}}"), vec!["lane"]);
    }

    #[test]
    fn test_substitute_wildcard() {
        let result = substitute_wildcard("reads/{sample}.fastq", "sample", "sample1");
        assert_eq!(result, "reads/sample1.fastq");
    }

    #[test]
    fn test_bindings_from_files_merge_sources() {
        let mut a = StepTemplate::new("a", "bash", "cat {input}");
        a.wildcard_files
            .insert("sample".into(), vec!["raw/x.fq".into(), "raw/y.fq".into()]);
        let mut b = StepTemplate::new("b", "bash", "cat {input}");
        b.wildcard_files
            .insert("sample".into(), vec!["other/y.fq".into(), "other/z.fq".into()]);

        let bindings = bindings_from_files(&[a, b]);
        assert_eq!(bindings.values("sample").unwrap(), ["x", "y", "z"]);
    }

    #[test]
    fn test_no_wildcards_single_instance_unchanged() {
        let steps = vec![StepTemplate::new("a", "bash", "echo a").with_output("a.txt")];
        let instances = expand_instances(&steps, &sample_bindings(&["x", "y"]));

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "a");
        assert_eq!(instances[0].command, "echo a");
        assert!(instances[0].wildcard.is_none());
    }

    #[test]
    fn test_empty_bindings_leave_token_in_place() {
        let steps = vec![StepTemplate::new("qc", "bash", "cat {input}").with_input("{sample}.fq")];
        let instances = expand_instances(&steps, &WildcardBindings::new());

        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].input, vec!["{sample}.fq"]);
    }

    #[test]
    fn test_expansion_fans_out_from_single_predecessor() {
        let steps = vec![
            StepTemplate::new("index", "bash", "make-index").with_output("ref.idx"),
            StepTemplate::new("align", "bash", "align {sample} {input} > {output}")
                .with_input("{sample}.fq")
                .with_output("{sample}.bam")
                .depends_on("index"),
        ];
        let instances = expand_instances(&steps, &sample_bindings(&["x", "y", "z"]));

        assert_eq!(instances.len(), 4);
        let aligned: Vec<_> = instances.iter().filter(|i| i.template == "align").collect();
        assert_eq!(aligned.len(), 3);

        for (instance, value) in aligned.iter().zip(["x", "y", "z"]) {
            assert_eq!(instance.id, format!("align_{}", value));
            assert_eq!(instance.input, vec![format!("{}.fq", value)]);
            assert_eq!(instance.output, vec![format!("{}.bam", value)]);
            assert_eq!(instance.command, format!("align {} {{input}} > {{output}}", value));
            assert_eq!(instance.previous, vec!["index"]);
        }
    }

    #[test]
    fn test_same_wildcard_links_by_value() {
        let steps = vec![
            StepTemplate::new("trim", "bash", "trim {input}")
                .with_input("{sample}.fq")
                .with_output("{sample}.trim.fq")
                .followed_by("align"),
            StepTemplate::new("align", "bash", "align {input}")
                .with_input("{sample}.trim.fq")
                .with_output("{sample}.bam")
                .depends_on("trim"),
        ];
        let instances = expand_instances(&steps, &sample_bindings(&["x", "y"]));

        let align_y = instances.iter().find(|i| i.id == "align_y").unwrap();
        assert_eq!(align_y.previous, vec!["trim_y"]);

        let trim_x = instances.iter().find(|i| i.id == "trim_x").unwrap();
        assert_eq!(trim_x.next, vec!["align_x"]);
    }

    #[test]
    fn test_unexpanded_step_fans_in_from_all_instances() {
        let steps = vec![
            StepTemplate::new("count", "bash", "wc -l {input}")
                .with_input("{sample}.fq")
                .with_output("{sample}.count"),
            StepTemplate::new("merge", "bash", "cat counts/* > {output}")
                .with_output("all.count")
                .depends_on("count"),
        ];
        let instances = expand_instances(&steps, &sample_bindings(&["x", "y"]));

        let merge = instances.iter().find(|i| i.id == "merge").unwrap();
        assert_eq!(merge.previous, vec!["count_x", "count_y"]);
    }

    #[test]
    fn test_unknown_reference_passes_through() {
        let steps = vec![StepTemplate::new("a", "bash", "echo a").depends_on("ghost")];
        let instances = expand_instances(&steps, &WildcardBindings::new());
        assert_eq!(instances[0].previous, vec!["ghost"]);
    }

    #[test]
    fn test_instances_follow_declaration_then_value_order() {
        let steps = vec![
            StepTemplate::new("b", "bash", "echo").with_input("{sample}.fq"),
            StepTemplate::new("a", "bash", "echo"),
        ];
        let instances = expand_instances(&steps, &sample_bindings(&["z", "x"]));
        let ids: Vec<_> = instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b_z", "b_x", "a"]);
    }
}
