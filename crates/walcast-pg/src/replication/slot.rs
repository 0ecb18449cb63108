//! Replication slot management.
//!
//! Handles creating and dropping wal2json logical replication slots over a regular
//! SQL connection.

use tokio_postgres::Client;
use tracing::info;
use walcast_core::SlotName;

use crate::error::PgResult;

/// Output plugin every slot is created with.
pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Create a logical replication slot with wal2json.
pub async fn create_slot(client: &Client, slot_name: &SlotName) -> PgResult<()> {
    info!(slot = %slot_name, plugin = OUTPUT_PLUGIN, "Creating replication slot");
    client
        .execute(
            "SELECT pg_create_logical_replication_slot($1, $2)",
            &[&slot_name.as_str(), &OUTPUT_PLUGIN],
        )
        .await?;

    Ok(())
}

/// Drop a replication slot.
pub async fn drop_slot(client: &Client, slot_name: &SlotName) -> PgResult<()> {
    info!(slot = %slot_name, "Dropping replication slot");
    client
        .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name.as_str()])
        .await?;

    Ok(())
}
