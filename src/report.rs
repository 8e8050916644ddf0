//! Reporting Stream
//!
//! The user-facing output of a run, separate from `log` diagnostics:
//! child output tagged with its instance id, `==>` status lines, dry-run
//! previews and the terminal summary.
//!
//! Write failures (a closed pipe, for instance) are ignored so that a
//! vanished reader never aborts the run.

use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colored::{Color, Colorize};

use crate::error::DefinitionError;
use crate::execution::scheduler::RunSummary;
use crate::execution::step::{OutputStream, PreparedLaunch};
use crate::workflow::StepInstance;

/// Writes the reporting stream of a run.
pub struct Reporter {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    colorize: bool,
}

impl Reporter {
    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>, colorize: bool) -> Self {
        Self { out, err, colorize }
    }

    /// Reports on the process's stdout/stderr, colored when stdout is a terminal.
    pub fn stdio() -> Self {
        let colorize = io::stdout().is_terminal();
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()), colorize)
    }

    /// Reports into in-memory buffers, uncolored.
    ///
    /// Returns the reporter and its `(stdout, stderr)` buffers.
    pub fn capture() -> (Self, SharedBuffer, SharedBuffer) {
        let out = SharedBuffer::default();
        let err = SharedBuffer::default();
        let reporter = Self::new(Box::new(out.clone()), Box::new(err.clone()), false);
        (reporter, out, err)
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.colorize {
            text.color(color).bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn status(&mut self, line: &str) {
        let _ = writeln!(self.out, "==> {}", line);
    }

    /// Forwards one line of child output.
    pub fn output(&mut self, instance: &str, stream: OutputStream, line: &str) {
        let _ = match stream {
            OutputStream::Stdout => writeln!(self.out, "[{}] {}", instance, line),
            OutputStream::Stderr => writeln!(self.err, "[{}] {}", instance, line),
        };
    }

    pub fn started(&mut self, instance: &str, command: &str) {
        self.status(&format!("Started {}: {}", instance, command));
    }

    pub fn succeeded(&mut self, instance: &str) {
        let label = self.paint("Succeeded", Color::Green);
        self.status(&format!("{} {}", label, instance));
    }

    pub fn failed(&mut self, instance: &str, reason: &str) {
        let label = self.paint("FAILED", Color::Red);
        self.status(&format!("{} {}: {}", label, instance, reason));
    }

    pub fn skipped(&mut self, instance: &str, cause: &str) {
        let label = self.paint("Skipped", Color::Yellow);
        self.status(&format!("{} {}: {}", label, instance, cause));
    }

    pub fn paused(&mut self, running: usize) {
        self.status(&format!(
            "Paused: no new instances will start ({} still running)",
            running
        ));
    }

    pub fn resumed(&mut self) {
        self.status("Resumed");
    }

    pub fn aborting(&mut self, running: usize) {
        let label = self.paint("Aborting", Color::Red);
        self.status(&format!(
            "{}: terminating {} running instance(s)",
            label, running
        ));
    }

    /// Preview of an instance that would be launched.
    pub fn dry_run(&mut self, instance: &StepInstance, launch: &PreparedLaunch) {
        let _ = writeln!(self.out);
        self.status(&format!("[DRY RUN] {}", instance.id));
        let _ = writeln!(self.out, "    Tool:        {}", instance.tool);
        let _ = writeln!(self.out, "    Environment: {}", launch.environment);
        let _ = writeln!(self.out, "    Command:     {}", launch.resolved);
        let _ = writeln!(self.out, "    Input:       {}", instance.input.join(" "));
        let _ = writeln!(self.out, "    Output:      {}", instance.output.join(" "));
        let _ = writeln!(self.out, "    Threads:     {}", instance.threads);
    }

    /// Lists every reason a definition was rejected.
    pub fn rejected(&mut self, error: &DefinitionError) {
        let label = self.paint("Pipeline rejected", Color::Red);
        let _ = writeln!(self.err, "==> {}:", label);
        for message in error.messages() {
            let _ = writeln!(self.err, "    - {}", message);
        }
        let _ = self.err.flush();
    }

    /// Terminal summary: counts, every non-success with its reason, verdict.
    pub fn summary(&mut self, summary: &RunSummary, elapsed: Duration) {
        let _ = writeln!(self.out);
        self.status(&format!("Summary: {} in {:.2?}", summary, elapsed));

        for (instance, reason) in &summary.failed {
            let label = self.paint("FAILED ", Color::Red);
            let _ = writeln!(self.out, "    {} {}: {}", label, instance, reason);
        }
        for (instance, cause) in &summary.skipped {
            let label = self.paint("SKIPPED", Color::Yellow);
            let _ = writeln!(self.out, "    {} {}: {}", label, instance, cause);
        }

        let verdict = if summary.is_success() {
            self.paint("Pipeline succeeded", Color::Green)
        } else {
            self.paint("Pipeline FAILED", Color::Red)
        };
        let _ = writeln!(self.out, "{}", verdict);

        let _ = self.out.flush();
        let _ = self.err.flush();
    }
}

/// Cloneable in-memory writer; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentResolver;
    use crate::error::{StructuralError, ValidationError};
    use crate::execution::step::prepare_launch;
    use crate::workflow::StepTemplate;

    #[test]
    fn test_output_lines_are_tagged_per_stream() {
        let (mut reporter, out, err) = Reporter::capture();
        reporter.output("align_s1", OutputStream::Stdout, "42 reads");
        reporter.output("align_s1", OutputStream::Stderr, "warning: low quality");

        assert_eq!(out.contents(), "[align_s1] 42 reads\n");
        assert_eq!(err.contents(), "[align_s1] warning: low quality\n");
    }

    #[test]
    fn test_status_lines() {
        let (mut reporter, out, _) = Reporter::capture();
        reporter.started("a", "echo hi");
        reporter.succeeded("a");
        reporter.failed("b", "exited with code 1");
        reporter.skipped("c", "upstream 'b' failed");
        reporter.paused(1);
        reporter.resumed();

        let text = out.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|l| l.starts_with("==> ")));
        assert_eq!(lines[0], "==> Started a: echo hi");
        assert_eq!(lines[2], "==> FAILED b: exited with code 1");
        assert_eq!(lines[3], "==> Skipped c: upstream 'b' failed");
    }

    #[test]
    fn test_summary_lists_failures_and_skips() {
        let (mut reporter, out, _) = Reporter::capture();
        let summary = RunSummary {
            succeeded: vec!["a".into()],
            failed: vec![("b".into(), "exited with code 1".into())],
            skipped: vec![("c".into(), "upstream 'b' failed".into())],
        };
        reporter.summary(&summary, Duration::from_millis(1500));

        let text = out.contents();
        assert!(text.contains("==> Summary: 1 succeeded, 1 failed, 1 skipped"));
        assert!(text.contains("FAILED  b: exited with code 1"));
        assert!(text.contains("SKIPPED c: upstream 'b' failed"));
        assert!(text.trim_end().ends_with("Pipeline FAILED"));
    }

    #[test]
    fn test_summary_success() {
        let (mut reporter, out, _) = Reporter::capture();
        let summary = RunSummary {
            succeeded: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        reporter.summary(&summary, Duration::from_secs(1));

        let text = out.contents();
        assert!(text.trim_end().ends_with("Pipeline succeeded"));
        assert!(!text.contains("FAILED"));
    }

    #[test]
    fn test_dry_run_block() {
        let template = StepTemplate::new("sort", "bash", "sort {input} > {output}")
            .with_input("data/in.txt")
            .with_output("out/sorted.txt");
        let instance = StepInstance::from_template(&template);
        let launch = prepare_launch(&instance, &EnvironmentResolver::ambient(), None, true).unwrap();

        let (mut reporter, out, _) = Reporter::capture();
        reporter.dry_run(&instance, &launch);

        let text = out.contents();
        assert!(text.contains("==> [DRY RUN] sort"));
        assert!(text.contains("Environment: ambient"));
        assert!(text.contains("Command:     sort data/in.txt > out/sorted.txt"));
        assert!(text.contains("Threads:     1"));
    }

    #[test]
    fn test_rejected_lists_every_error() {
        let error = DefinitionError::Invalid(vec![
            ValidationError::DuplicateStepId("a".into()),
            ValidationError::ZeroThreads("b".into()),
        ]);
        let (mut reporter, out, err) = Reporter::capture();
        reporter.rejected(&error);

        let text = err.contents();
        assert!(text.starts_with("==> Pipeline rejected:"));
        assert_eq!(text.lines().filter(|l| l.starts_with("    - ")).count(), 2);
        assert!(out.contents().is_empty());

        let (mut reporter, _, err) = Reporter::capture();
        reporter.rejected(&DefinitionError::Structural(StructuralError::DanglingReference {
            step: "b".into(),
            reference: "ghost".into(),
        }));
        assert!(err.contents().contains("ghost"));
    }

    #[test]
    fn test_colorize_off_has_no_escape_codes() {
        let (mut reporter, out, _) = Reporter::capture();
        reporter.failed("x", "boom");
        assert!(!out.contents().contains('\u{1b}'));
    }
}
