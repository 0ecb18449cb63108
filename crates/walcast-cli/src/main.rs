use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod env;

use cli::{Cli, Commands};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("walcast=info"))
}

fn log_subscriber<W>(filter: EnvFilter, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only events
    log_subscriber(default_filter(), std::io::stderr).try_init()?;
    env::load_dotenv_from_ancestors()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => commands::cmd_init(Path::new(".")),
        Commands::Listen {
            recreate_slot,
            pretty,
        } => {
            let config = config::load_config(&cli.config)?;
            commands::cmd_listen(config, recreate_slot, pretty).await
        }
        Commands::DeleteSlot { yes } => {
            let config = config::load_config(&cli.config)?;
            commands::cmd_delete_slot(config, yes).await
        }
        Commands::Ddl => {
            let file = config::load_file(&cli.config)?;
            commands::cmd_ddl(&file)
        }
    }
}
