use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use walcast_config::ListenerFile;
use walcast_core::{FieldMap, ListenerConfig};

/// Read and parse a walcast.toml file.
pub fn load_file(path: &Path) -> Result<ListenerFile> {
    let content = fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\nRun 'walcast init' to create one.",
            path.display()
        )
    })?;

    ListenerFile::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the listener config, resolving `${VAR}` references from the environment.
pub fn load_config(path: &Path) -> Result<ListenerConfig<FieldMap>> {
    let file = load_file(path)?;
    walcast_config::to_listener_config(&file)
        .with_context(|| format!("Invalid config: {}", path.display()))
}
