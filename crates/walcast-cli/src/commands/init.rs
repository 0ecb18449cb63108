use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use tracing::info;

const CONFIG_TEMPLATE: &str = r#"# walcast configuration
# ${VAR} references are read from the environment (or a .env file)

slot = "walcast"
connection_string = "${DATABASE_URL}"
status_interval_secs = 10

[flow]
replay = 0
extra_buffer_capacity = 32
overflow = "suspend"          # suspend | drop_oldest | drop_latest

[backoff]
min_delay_ms = 500
max_delay_ms = 8000

[properties]
application_name = "walcast"

[[tables]]
name = "public.orders"
replica_identity = "full"     # default | full | nothing | "using index <name>"
"#;

const ENV_TEMPLATE: &str = r#"# walcast environment variables
# Copy this file to .env and fill in your values

# Postgres connection string. The role needs the REPLICATION attribute and the
# server must run with wal_level = logical and the wal2json plugin installed.
DATABASE_URL=
"#;

/// Write a sample walcast.toml and .env.example into `dir`, keeping existing files.
pub fn cmd_init(dir: &Path) -> Result<()> {
    println!("Initializing walcast in {}...\n", dir.display());

    write_if_missing(&dir.join("walcast.toml"), CONFIG_TEMPLATE)?;
    write_if_missing(&dir.join(".env.example"), ENV_TEMPLATE)?;

    let gitignore = dir.join(".gitignore");
    if gitignore.exists() {
        let content = fs::read_to_string(&gitignore)?;
        if !content.lines().any(|line| line.trim() == ".env") {
            let mut file = fs::OpenOptions::new().append(true).open(&gitignore)?;
            writeln!(file, "\n# walcast secrets\n.env")?;
            println!("Added .env to .gitignore");
        }
    } else {
        fs::write(&gitignore, "# walcast secrets\n.env\n")?;
        println!("Created .gitignore with .env");
    }

    println!("\n{}", "walcast initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Copy .env.example to .env and set DATABASE_URL");
    println!("  2. Edit walcast.toml to list the tables to capture");
    println!("  3. Run: walcast listen\n");

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    if path.exists() {
        println!("{} already exists, skipping", name);
    } else {
        fs::write(path, content)?;
        info!(path = %path.display(), "Created {}", name);
        println!("Created {}", name);
    }
    Ok(())
}
