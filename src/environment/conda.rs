//! Conda/Micromamba Environment Resolution
//!
//! Maps step tools to isolated micromamba environments and wraps commands so
//! they run inside them. Unmapped tools run in the ambient environment.
//!
//! # Lookup Order
//!
//! The micromamba binary and the environment map are resolved in this order:
//! 1. Next to the engine executable
//! 2. `{project_root}/runtime/`
//! 3. System PATH (micromamba) or the current directory (env map)

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::EnvironmentError;

/// Shell used for every step command; `-e` aborts on the first failing line.
pub const SHELL: &str = "bash";
const SHELL_ARGS: &[&str] = &["-e", "-c"];

const ENV_MAP_FILE: &str = "env_map.json";
const MICROMAMBA_BIN: &str = "micromamba";

/// Tools available on the standard system PATH; never provisioned.
pub const SYSTEM_TOOLS: &[&str] = &[
    "bash", "sh", "echo", "cat", "cp", "mv", "rm", "mkdir", "sleep", "touch", "ls", "grep", "sed",
    "awk", "head", "tail", "sort", "uniq", "wc", "cut", "tr", "tee", "curl", "wget", "gzip",
    "gunzip", "tar", "zip", "unzip", "bc", "date", "find", "xargs", "diff", "paste", "printf",
    "true", "false",
];

pub fn is_system_tool(tool: &str) -> bool {
    SYSTEM_TOOLS.contains(&tool)
}

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn runtime_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("runtime")
}

/// Default location of the environment map when none is given explicitly.
pub fn default_env_map_path() -> PathBuf {
    if let Some(path) = exe_dir().map(|dir| dir.join(ENV_MAP_FILE)) {
        if path.exists() {
            debug!("Using env map next to executable: {}", path.display());
            return path;
        }
    }

    let dev_path = runtime_dir().join(ENV_MAP_FILE);
    if dev_path.exists() {
        debug!("Using development env map: {}", dev_path.display());
        return dev_path;
    }

    PathBuf::from(ENV_MAP_FILE)
}

/// Lazily-resolved path to the micromamba binary.
pub static MICROMAMBA_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    let candidates = exe_dir()
        .into_iter()
        .chain(std::iter::once(runtime_dir()))
        .chain(std::env::split_paths(&search_path))
        .map(|dir| dir.join(MICROMAMBA_BIN));

    for candidate in candidates {
        if candidate.is_file() {
            info!("Using micromamba: {}", candidate.display());
            return candidate;
        }
    }

    warn!("Micromamba binary not found next to the executable, in runtime/, or on PATH");
    PathBuf::from(MICROMAMBA_BIN)
});

/// Root prefix under which engine-managed environments live.
pub static MAMBA_ROOT_PREFIX: Lazy<PathBuf> = Lazy::new(|| {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    let prefix = PathBuf::from(home).join(".pipeline-engine").join("micromamba");
    if !prefix.exists() {
        if let Err(e) = fs::create_dir_all(&prefix) {
            warn!("Failed to create micromamba root prefix: {}", e);
        }
    }
    prefix
});

/// Tool name to environment name, stored as `{"map": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMapping {
    map: BTreeMap<String, String>,
}

impl EnvironmentMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a mapping file; a missing file is an empty mapping.
    pub fn try_load(path: &Path) -> Result<Self, EnvironmentError> {
        if !path.exists() {
            debug!("No env map at {}", path.display());
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path).map_err(|source| EnvironmentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| EnvironmentError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`Self::try_load`], but an unreadable file falls back to an empty mapping.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(mapping) => {
                info!("Loaded {} environment mapping(s)", mapping.len());
                mapping
            }
            Err(e) => {
                warn!("{}; running every tool in the ambient environment", e);
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EnvironmentError> {
        let io_err = |source| EnvironmentError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| EnvironmentError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)?;

        info!("Environment map saved to: {}", path.display());
        Ok(())
    }

    pub fn get(&self, tool: &str) -> Option<&str> {
        self.map.get(tool).map(String::as_str)
    }

    pub fn set(&mut self, tool: impl Into<String>, env: impl Into<String>) {
        self.map.insert(tool.into(), env.into());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A fully specified process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, PathBuf)>,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Where a step's command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentHandle {
    /// The engine's own environment
    Ambient,
    /// A named micromamba environment, activated per launch
    Isolated {
        env_name: String,
        launcher: PathBuf,
        root_prefix: PathBuf,
    },
}

impl EnvironmentHandle {
    /// Wraps a resolved shell command for this environment.
    pub fn wrap(&self, command: &str) -> LaunchCommand {
        let shell_args = SHELL_ARGS
            .iter()
            .map(|a| a.to_string())
            .chain(std::iter::once(command.to_string()));

        match self {
            Self::Ambient => LaunchCommand {
                program: PathBuf::from(SHELL),
                args: shell_args.collect(),
                env: Vec::new(),
            },
            Self::Isolated {
                env_name,
                launcher,
                root_prefix,
            } => LaunchCommand {
                program: launcher.clone(),
                args: ["run", "-n", env_name.as_str(), SHELL]
                    .iter()
                    .map(|a| a.to_string())
                    .chain(shell_args)
                    .collect(),
                env: vec![("MAMBA_ROOT_PREFIX".to_string(), root_prefix.clone())],
            },
        }
    }
}

impl fmt::Display for EnvironmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient => write!(f, "ambient"),
            Self::Isolated { env_name, .. } => write!(f, "micromamba:{}", env_name),
        }
    }
}

/// Resolves tools to environment handles. Never fails.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    mapping: EnvironmentMapping,
    launcher: PathBuf,
    root_prefix: PathBuf,
}

impl EnvironmentResolver {
    pub fn new(mapping: EnvironmentMapping) -> Self {
        Self::with_launcher(mapping, MICROMAMBA_PATH.clone(), MAMBA_ROOT_PREFIX.clone())
    }

    pub fn with_launcher(
        mapping: EnvironmentMapping,
        launcher: impl Into<PathBuf>,
        root_prefix: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mapping,
            launcher: launcher.into(),
            root_prefix: root_prefix.into(),
        }
    }

    /// A resolver that runs everything in the ambient environment.
    pub fn ambient() -> Self {
        Self::with_launcher(EnvironmentMapping::new(), MICROMAMBA_BIN, ".")
    }

    pub fn resolve(&self, tool: &str) -> EnvironmentHandle {
        match self.mapping.get(tool) {
            Some(env_name) => EnvironmentHandle::Isolated {
                env_name: env_name.to_string(),
                launcher: self.launcher.clone(),
                root_prefix: self.root_prefix.clone(),
            },
            None => EnvironmentHandle::Ambient,
        }
    }

    pub fn mapping(&self) -> &EnvironmentMapping {
        &self.mapping
    }
}

fn micromamba_command() -> Command {
    let mut cmd = Command::new(&*MICROMAMBA_PATH);
    cmd.env("MAMBA_ROOT_PREFIX", &*MAMBA_ROOT_PREFIX);
    cmd
}

/// Checks whether a micromamba environment exists.
async fn check_env(env_name: &str) -> Result<bool, EnvironmentError> {
    let output = micromamba_command()
        .args(["env", "list"])
        .output()
        .await
        .map_err(|e| EnvironmentError::Micromamba(format!("failed to run env list: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EnvironmentError::Micromamba(format!(
            "failed to list environments: {}",
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .any(|line| line.split_whitespace().next() == Some(env_name)))
}

/// Creates a micromamba environment with the given packages.
///
/// Returns immediately when the environment already exists.
pub async fn create_env(env_name: &str, packages: &[String]) -> Result<(), EnvironmentError> {
    if check_env(env_name).await? {
        info!("Environment '{}' already exists", env_name);
        return Ok(());
    }

    info!("Creating environment '{}' with {:?}", env_name, packages);
    let output = micromamba_command()
        .args(["create", "-y", "-n", env_name, "-c", "bioconda", "-c", "conda-forge"])
        .args(packages)
        .output()
        .await
        .map_err(|e| EnvironmentError::Micromamba(format!("failed to run create: {}", e)))?;

    if output.status.success() {
        info!("Created environment '{}'", env_name);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Failed to create environment '{}': {}", env_name, stderr.trim());
        Err(EnvironmentError::Micromamba(format!(
            "could not create environment '{}'",
            env_name
        )))
    }
}

/// Tools that would get a new environment: unmapped and not system tools.
pub fn tools_needing_environments(tools: &[String], mapping: &EnvironmentMapping) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| !is_system_tool(tool) && mapping.get(tool).is_none())
        .cloned()
        .collect()
}

/// Creates one environment per unmapped tool, named after the tool.
///
/// Failures are logged and skipped. Returns the number of tools added to
/// the mapping.
pub async fn provision_environments(tools: &[String], mapping: &mut EnvironmentMapping) -> usize {
    let pending = tools_needing_environments(tools, mapping);
    if pending.is_empty() {
        info!("No environments to provision");
        return 0;
    }

    info!("Provisioning environments for {} tool(s): {:?}", pending.len(), pending);
    let mut added = 0;

    for tool in pending {
        match create_env(&tool, std::slice::from_ref(&tool)).await {
            Ok(()) => {
                mapping.set(tool.clone(), tool);
                added += 1;
            }
            Err(e) => warn!("Skipping environment for '{}': {}", tool, e),
        }
    }
    added
}
