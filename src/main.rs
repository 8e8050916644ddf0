//! Pipeline Engine CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Execute a pipeline
//! engine pipeline.yaml
//!
//! # With pause control
//! engine pipeline.yaml /tmp/pause.flag
//!
//! # Preview resolved commands
//! engine pipeline.yaml --dry-run
//!
//! # Batch over wildcard values, 8-wide
//! engine pipeline.yaml --wildcards samples.json --parallel 8 --working-dir /data/analysis
//! ```
//!
//! Exit codes: 0 success, 1 failed or skipped instances, 2 definition
//! rejected, 130 interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use pipeline_engine::environment::{
    default_env_map_path, provision_environments, EnvironmentMapping, EnvironmentResolver,
};
use pipeline_engine::workflow::{load_wildcard_bindings, WildcardBindings};
use pipeline_engine::{
    load_pipeline, prepare_pipeline, Cli, Engine, EngineConfig, Reporter, APP_NAME, VERSION,
};

/// Exit code when the definition is rejected before anything runs.
const EXIT_REJECTED: u8 = 2;

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!();
}

async fn load_environments(cli: &Cli, tools: &[String]) -> EnvironmentMapping {
    let path: PathBuf = cli.env_map.clone().unwrap_or_else(default_env_map_path);
    let mut mapping = EnvironmentMapping::load(&path);
    info!(
        "Environment map: {} ({} tool(s) mapped)",
        path.display(),
        mapping.len()
    );

    if cli.provision_envs && !cli.dry_run {
        let added = provision_environments(tools, &mut mapping).await;
        if added > 0 {
            if let Err(e) = mapping.save(&path) {
                warn!("Failed to save environment map: {}", e);
            }
        }
    }
    mapping
}

async fn run(cli: Cli) -> Result<u8, Box<dyn std::error::Error>> {
    let config = EngineConfig::from_cli(&cli)?;
    let mut reporter = Reporter::stdio();

    match &config.working_dir {
        Some(dir) => info!("Working directory: {}", dir.display()),
        None => info!("Working directory: {}", std::env::current_dir()?.display()),
    }

    info!("Loading pipeline: {}", cli.definition.display());
    let definition = match load_pipeline(&cli.definition) {
        Ok(definition) => definition,
        Err(e) => {
            reporter.rejected(&e);
            return Ok(EXIT_REJECTED);
        }
    };

    let extra = match &cli.wildcards {
        Some(path) => match load_wildcard_bindings(path) {
            Ok(bindings) => bindings,
            Err(e) => {
                reporter.rejected(&e);
                return Ok(EXIT_REJECTED);
            }
        },
        None => WildcardBindings::new(),
    };

    let tools = definition.tools();
    info!(
        "Pipeline loaded: {} steps, {} unique tools",
        definition.steps.len(),
        tools.len()
    );

    let graph = match prepare_pipeline(definition, extra) {
        Ok(graph) => graph,
        Err(e) => {
            reporter.rejected(&e);
            return Ok(EXIT_REJECTED);
        }
    };

    let mapping = load_environments(&cli, &tools).await;
    let mut engine = Engine::new(config, EnvironmentResolver::new(mapping), reporter);
    let report = engine.run(graph).await;

    if let Some(path) = &cli.timeline {
        match report.timeline.write_json(path) {
            Ok(()) => info!("Timeline written to {}", path.display()),
            Err(e) => error!("{}", e),
        }
    }

    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    print_banner();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
