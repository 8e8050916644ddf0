//! Individual Instance Execution
//!
//! Handles everything about launching a single step instance:
//! - Placeholder resolution (`{input}`, `{output}` and their plural aliases)
//! - Output directory creation
//! - Environment wrapping
//! - The worker task that runs the process and streams its output
//!
//! Workers never touch run state; they only send [`WorkerEvent`]s back to
//! the control loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::environment::{EnvironmentHandle, EnvironmentResolver, LaunchCommand};
use crate::error::{LaunchError, ResolutionError};
use crate::monitoring::kill_process_tree;
use crate::workflow::wildcards::unresolved_tokens;
use crate::workflow::StepInstance;

/// Failure reason recorded for instances killed by an abort.
pub const ABORTED: &str = "aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Notifications from a worker to the control loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Started {
        idx: usize,
        pid: Option<u32>,
    },
    Output {
        idx: usize,
        stream: OutputStream,
        line: String,
    },
    /// Always the last event of a worker; every output line precedes it.
    Exited {
        idx: usize,
        result: Result<(), String>,
    },
}

/// An instance ready to run: its resolved command and how to launch it.
#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub resolved: String,
    pub environment: EnvironmentHandle,
    pub command: LaunchCommand,
}

fn join_paths(paths: &[String]) -> String {
    paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substitutes an instance's paths into its command text.
///
/// Multiple paths are joined with a single space. Fails when a wildcard
/// token survived expansion anywhere in the paths or the command.
pub fn resolve_command(instance: &StepInstance) -> Result<String, ResolutionError> {
    let texts = instance
        .input
        .iter()
        .chain(&instance.output)
        .chain(std::iter::once(&instance.command));

    for text in texts {
        if let Some(name) = unresolved_tokens(text).into_iter().next() {
            return Err(ResolutionError::UnboundWildcard { name });
        }
    }

    let inputs = join_paths(&instance.input);
    let outputs = join_paths(&instance.output);

    Ok(instance
        .command
        .replace("{input}", &inputs)
        .replace("{output}", &outputs)
        .replace("{inputs}", &inputs)
        .replace("{outputs}", &outputs))
}

/// Creates missing parent directories of the instance's outputs.
pub fn ensure_output_directories(
    instance: &StepInstance,
    working_dir: Option<&Path>,
) -> Result<(), LaunchError> {
    for output in instance.output_paths(working_dir) {
        let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) else {
            continue;
        };
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| LaunchError::OutputDir {
                path: parent.to_path_buf(),
                source,
            })?;
            debug!("Created directory: {}", parent.display());
        }
    }
    Ok(())
}

/// Resolves, wraps and (unless `dry_run`) prepares the filesystem for launch.
pub fn prepare_launch(
    instance: &StepInstance,
    resolver: &EnvironmentResolver,
    working_dir: Option<&Path>,
    dry_run: bool,
) -> Result<PreparedLaunch, LaunchError> {
    let resolved = resolve_command(instance)?;
    let environment = resolver.resolve(&instance.tool);
    let command = environment.wrap(&resolved);

    if !dry_run {
        ensure_output_directories(instance, working_dir)?;
    }

    Ok(PreparedLaunch {
        resolved,
        environment,
        command,
    })
}

/// Spawns a worker that runs `command` and reports back on `events`.
///
/// A change on `shutdown` kills the child with all its descendants and
/// reports it as aborted.
pub fn spawn_worker(
    idx: usize,
    command: LaunchCommand,
    working_dir: Option<PathBuf>,
    events: mpsc::Sender<WorkerEvent>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = run_process(idx, &command, working_dir.as_deref(), &events, shutdown).await;
        let _ = events.send(WorkerEvent::Exited { idx, result }).await;
    })
}

async fn run_process(
    idx: usize,
    launch: &LaunchCommand,
    working_dir: Option<&Path>,
    events: &mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &launch.env {
        cmd.env(key, value);
    }
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::Spawn(e).to_string())?;

    let _ = events
        .send(WorkerEvent::Started {
            idx,
            pid: child.id(),
        })
        .await;

    let pumps: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| pump_lines(idx, out, OutputStream::Stdout, events.clone())),
        child
            .stderr
            .take()
            .map(|err| pump_lines(idx, err, OutputStream::Stderr, events.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = shutdown.changed() => None,
    };

    let status = match exited {
        Some(status) => status.map_err(|e| format!("failed to wait for process: {}", e))?,
        None => {
            if let Some(pid) = child.id() {
                match tokio::task::spawn_blocking(move || kill_process_tree(pid)).await {
                    Ok(killed) => debug!("Killed {} process(es) of instance #{}", killed, idx),
                    Err(e) => warn!("Could not kill process tree of instance #{}: {}", idx, e),
                }
            }
            let _ = child.kill().await;
            return Err(ABORTED.to_string());
        }
    };

    for pump in pumps {
        let _ = pump.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(match status.code() {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        })
    }
}

/// Forwards a child stream line by line. Invalid UTF-8 is replaced, not fatal.
fn pump_lines<R>(
    idx: usize,
    reader: R,
    stream: OutputStream,
    events: mpsc::Sender<WorkerEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if events
                        .send(WorkerEvent::Output { idx, stream, line })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Stream read error for instance #{}: {}", idx, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepTemplate;
    use std::time::Duration;
    use tempfile::tempdir;

    fn instance(template: StepTemplate) -> StepInstance {
        StepInstance::from_template(&template)
    }

    async fn collect(mut rx: mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, WorkerEvent::Exited { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_resolve_joins_paths_with_single_space() {
        let step = instance(
            StepTemplate::new("cat", "bash", "cat {input} > {output}")
                .with_input("a.txt")
                .with_input("b.txt")
                .with_output("out.txt"),
        );
        assert_eq!(resolve_command(&step).unwrap(), "cat a.txt b.txt > out.txt");
    }

    #[test]
    fn test_resolve_plural_aliases() {
        let step = instance(
            StepTemplate::new("s", "bash", "tool {inputs} -o {outputs}")
                .with_input("x")
                .with_output("y"),
        );
        assert_eq!(resolve_command(&step).unwrap(), "tool x -o y");
    }

    #[test]
    fn test_resolve_without_paths_leaves_empty() {
        let step = instance(StepTemplate::new("s", "bash", "echo [{input}]"));
        assert_eq!(resolve_command(&step).unwrap(), "echo []");
    }

    #[test]
    fn test_resolve_keeps_shell_expansions() {
        let step = instance(StepTemplate::new("s", "bash", "echo ${HOME} | awk '{print $1}'"));
        assert_eq!(
            resolve_command(&step).unwrap(),
            "echo ${HOME} | awk '{print $1}'"
        );
    }

    #[test]
    fn test_resolve_unbound_wildcard_in_path() {
        let step = instance(StepTemplate::new("s", "bash", "cat {input}").with_input("{sample}.fq"));
        assert_eq!(
            resolve_command(&step).unwrap_err(),
            ResolutionError::UnboundWildcard {
                name: "sample".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_unbound_wildcard_in_command() {
        let step = instance(StepTemplate::new("s", "bash", "echo {lane}"));
        assert!(resolve_command(&step).is_err());
    }

    #[test]
    fn test_ensure_output_directories() {
        let temp_dir = tempdir().unwrap();
        let step = instance(
            StepTemplate::new("s", "bash", "touch {output}")
                .with_output("subdir1/subdir2/output.txt")
                .with_output("flat.txt"),
        );

        ensure_output_directories(&step, Some(temp_dir.path())).unwrap();
        assert!(temp_dir.path().join("subdir1/subdir2").is_dir());
    }

    #[test]
    fn test_ensure_output_directories_absolute() {
        let temp_dir = tempdir().unwrap();
        let output = temp_dir.path().join("newdir/output.txt");
        let step = instance(
            StepTemplate::new("s", "bash", "touch {output}").with_output(output.to_str().unwrap()),
        );

        ensure_output_directories(&step, None).unwrap();
        assert!(temp_dir.path().join("newdir").is_dir());
    }

    #[test]
    fn test_prepare_launch_dry_run_creates_nothing() {
        let temp_dir = tempdir().unwrap();
        let step = instance(
            StepTemplate::new("s", "bash", "touch {output}").with_output("deep/out.txt"),
        );

        let prepared =
            prepare_launch(&step, &EnvironmentResolver::ambient(), Some(temp_dir.path()), true)
                .unwrap();
        assert_eq!(prepared.resolved, "touch deep/out.txt");
        assert_eq!(prepared.environment, EnvironmentHandle::Ambient);
        assert!(!temp_dir.path().join("deep").exists());
    }

    #[tokio::test]
    async fn test_worker_streams_output_then_exit() {
        let temp_dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let command = EnvironmentHandle::Ambient.wrap("echo out; echo err >&2; exit 3");
        spawn_worker(7, command, Some(temp_dir.path().to_path_buf()), tx, shutdown_rx);

        let events = collect(rx).await;
        assert!(matches!(events[0], WorkerEvent::Started { idx: 7, pid: Some(_) }));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Output { stream: OutputStream::Stdout, line, .. } if line == "out"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Output { stream: OutputStream::Stderr, line, .. } if line == "err"
        )));
        match events.last() {
            Some(WorkerEvent::Exited { idx: 7, result: Err(reason) }) => {
                assert_eq!(reason, "exited with code 3")
            }
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_runs_in_working_dir() {
        let temp_dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let command = EnvironmentHandle::Ambient.wrap("echo hello > here.txt");
        spawn_worker(0, command, Some(temp_dir.path().to_path_buf()), tx, shutdown_rx);

        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(WorkerEvent::Exited { result: Ok(()), .. })));
        assert!(temp_dir.path().join("here.txt").exists());
    }

    #[tokio::test]
    async fn test_worker_spawn_failure() {
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let command = LaunchCommand {
            program: PathBuf::from("/nonexistent/launcher"),
            args: Vec::new(),
            env: Vec::new(),
        };
        spawn_worker(1, command, None, tx, shutdown_rx);

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Exited { result: Err(r), .. } if r.contains("failed to start")));
    }

    #[tokio::test]
    async fn test_worker_shutdown_kills_child() {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let command = EnvironmentHandle::Ambient.wrap("sleep 30");
        spawn_worker(2, command, None, tx, shutdown_rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .unwrap();
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Exited { result: Err(r), .. }) if r == ABORTED
        ));
    }
}
