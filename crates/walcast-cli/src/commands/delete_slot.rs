use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use walcast_core::{FieldMap, ListenerConfig};
use walcast_pg::WalListener;

pub async fn cmd_delete_slot(config: ListenerConfig<FieldMap>, yes: bool) -> Result<()> {
    let slot = config.slot_name.clone();

    if !yes {
        println!("{}", "WARNING: Dangerous Operation".red().bold());
        println!(
            "Deleting slot '{}' discards its position. Changes made before the next listen are lost.\n",
            slot
        );
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete replication slot '{}'?", slot))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborting.");
            return Ok(());
        }
    }

    let listener = WalListener::new(config)?;
    listener
        .delete_slot()
        .await
        .with_context(|| format!("Failed to delete replication slot '{}'", slot))?;

    println!("{}", format!("Replication slot '{}' deleted.", slot).green());
    Ok(())
}
