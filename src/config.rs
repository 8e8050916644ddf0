//! Command-line surface and run configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::warn;

use crate::error::ConfigError;
use crate::execution::pause::{PauseSignal, PAUSE_CHECK_INTERVAL};
use crate::execution::scheduler::FailureMode;
use crate::monitoring::resource::MONITOR_SAMPLE_INTERVAL;

/// Default global parallelism budget.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Parser, Debug, Clone)]
#[command(name = "engine", version, about = "Runs a pipeline definition as a dependency-ordered DAG")]
pub struct Cli {
    /// Pipeline definition file (YAML or JSON)
    pub definition: PathBuf,

    /// Pause signal file: while it exists, no new instances start
    pub signal: Option<PathBuf>,

    /// Report resolved commands without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Directory child processes run in; relative outputs resolve against it
    #[arg(long, value_name = "PATH")]
    pub working_dir: Option<PathBuf>,

    /// Global parallelism budget
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_PARALLEL, value_parser = parse_parallel)]
    pub parallel: usize,

    /// JSON file mapping wildcard names to value lists
    #[arg(long, value_name = "PATH")]
    pub wildcards: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Tool to environment mapping file
    #[arg(long, value_name = "PATH")]
    pub env_map: Option<PathBuf>,

    /// Create missing micromamba environments before running
    #[arg(long)]
    pub provision_envs: bool,

    /// Stop launching after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Write the run timeline as JSON
    #[arg(long, value_name = "PATH")]
    pub timeline: Option<PathBuf>,

    /// Scheduling tick and pause poll interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = PAUSE_CHECK_INTERVAL.as_millis() as u64)]
    pub tick_ms: u64,
}

fn parse_parallel(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid number: {}", value)),
    }
}

/// Settings of one engine run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel: usize,
    pub dry_run: bool,
    pub working_dir: Option<PathBuf>,
    pub pause: PauseSignal,
    /// Scheduling tick; the pause signal is polled this often
    pub tick: Duration,
    pub monitor_interval: Duration,
    pub failure_mode: FailureMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            dry_run: false,
            working_dir: None,
            pause: PauseSignal::disabled(),
            tick: PAUSE_CHECK_INTERVAL,
            monitor_interval: MONITOR_SAMPLE_INTERVAL,
            failure_mode: FailureMode::Isolate,
        }
    }
}

impl EngineConfig {
    /// Builds the run configuration from parsed arguments.
    ///
    /// The working directory must exist and be a directory. A budget above
    /// the host CPU count is allowed but logged.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if let Some(dir) = &cli.working_dir {
            if !dir.exists() {
                return Err(ConfigError::MissingWorkingDir(dir.clone()));
            }
            if !dir.is_dir() {
                return Err(ConfigError::NotADirectory(dir.clone()));
            }
        }

        let cpus = num_cpus::get();
        if cli.parallel > cpus {
            warn!(
                "Parallel budget {} exceeds the {} available CPUs",
                cli.parallel, cpus
            );
        }

        Ok(Self {
            max_parallel: cli.parallel.max(1),
            dry_run: cli.dry_run,
            working_dir: cli.working_dir.clone(),
            pause: PauseSignal::from(cli.signal.clone()),
            tick: Duration::from_millis(cli.tick_ms.max(1)),
            failure_mode: if cli.fail_fast {
                FailureMode::FailFast
            } else {
                FailureMode::Isolate
            },
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("engine").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["pipeline.yaml"]).unwrap();
        assert_eq!(cli.definition, PathBuf::from("pipeline.yaml"));
        assert_eq!(cli.signal, None);
        assert_eq!(cli.parallel, 4);
        assert_eq!(cli.tick_ms, 500);
        assert!(!cli.dry_run && !cli.fail_fast && !cli.verbose);

        let config = EngineConfig::from_cli(&cli).unwrap();
        assert_eq!(config.failure_mode, FailureMode::Isolate);
        assert_eq!(config.pause, PauseSignal::disabled());
        assert_eq!(config.tick, Duration::from_millis(500));
    }

    #[test]
    fn test_all_options() {
        let dir = tempdir().unwrap();
        let work = dir.path().to_str().unwrap();
        let cli = parse(&[
            "pipeline.yaml",
            "/tmp/pause.flag",
            "--dry-run",
            "--working-dir",
            work,
            "--parallel",
            "2",
            "--wildcards",
            "wc.json",
            "--verbose",
            "--env-map",
            "env.json",
            "--provision-envs",
            "--fail-fast",
            "--timeline",
            "t.json",
            "--tick-ms",
            "50",
        ])
        .unwrap();
        assert_eq!(cli.wildcards, Some(PathBuf::from("wc.json")));
        assert_eq!(cli.env_map, Some(PathBuf::from("env.json")));
        assert!(cli.provision_envs);

        let config = EngineConfig::from_cli(&cli).unwrap();
        assert_eq!(config.max_parallel, 2);
        assert!(config.dry_run);
        assert_eq!(config.working_dir.as_deref(), Some(dir.path()));
        assert_eq!(config.pause.path(), Some(std::path::Path::new("/tmp/pause.flag")));
        assert_eq!(config.tick, Duration::from_millis(50));
        assert_eq!(config.failure_mode, FailureMode::FailFast);
    }

    #[test]
    fn test_parallel_must_be_positive() {
        assert!(parse(&["p.yaml", "--parallel", "0"]).is_err());
        assert!(parse(&["p.yaml", "--parallel", "many"]).is_err());
    }

    #[test]
    fn test_definition_required() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn test_working_dir_must_exist() {
        let cli = parse(&["p.yaml", "--working-dir", "/nonexistent/work/dir"]).unwrap();
        assert!(matches!(
            EngineConfig::from_cli(&cli),
            Err(ConfigError::MissingWorkingDir(_))
        ));
    }

    #[test]
    fn test_working_dir_must_be_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        let cli = parse(&["p.yaml", "--working-dir", file.to_str().unwrap()]).unwrap();
        assert!(matches!(
            EngineConfig::from_cli(&cli),
            Err(ConfigError::NotADirectory(_))
        ));
    }
}
