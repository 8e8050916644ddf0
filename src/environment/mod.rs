//! Environment Management Module
//!
//! Resolves step tools to isolated micromamba environments and optionally
//! provisions missing ones before a run.

pub mod conda;

pub use conda::{
    default_env_map_path, provision_environments, EnvironmentHandle, EnvironmentMapping,
    EnvironmentResolver, LaunchCommand, MAMBA_ROOT_PREFIX, MICROMAMBA_PATH,
};
