use anyhow::{Context, Result};
use colored::Colorize;
use walcast_config::ListenerFile;
use walcast_core::TableRegistry;

/// Replica identity statements the listener runs on start, one per table.
fn render_ddl<R>(tables: &TableRegistry<R>) -> Vec<String> {
    tables.iter().map(|t| t.replica_identity_ddl()).collect()
}

pub fn cmd_ddl(file: &ListenerFile) -> Result<()> {
    let tables = walcast_config::table_registry(file).context("Invalid table configuration")?;

    if tables.is_empty() {
        eprintln!("{}", "No tables configured in walcast.toml".yellow());
        return Ok(());
    }

    for statement in render_ddl(&tables) {
        println!("{}", statement);
    }
    Ok(())
}
