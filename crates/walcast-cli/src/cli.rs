use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "walcast")]
#[command(about = "Stream Postgres row changes from a wal2json replication slot")]
#[command(version)]
pub struct Cli {
    /// Path to the walcast.toml config file
    #[arg(short, long, global = true, default_value = "walcast.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a sample walcast.toml and .env.example in the current directory
    Init,

    /// Stream changes for the configured tables as JSON lines on stdout
    Listen {
        /// Drop and recreate the replication slot before streaming
        #[arg(long)]
        recreate_slot: bool,

        /// Pretty-print each event
        #[arg(long)]
        pretty: bool,
    },

    /// Delete the replication slot
    DeleteSlot {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Print the replica identity statements for the configured tables
    Ddl,
}
