//! Connection seam between the listener and Postgres.
//!
//! [`PgBackend`] talks to a real server; [`crate::mock::MockBackend`] scripts the same
//! interactions in memory.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio_postgres::Client;
use walcast_core::SlotName;

use crate::connect::connect_postgres;
use crate::error::PgResult;
use crate::replication::{
    create_slot, drop_slot, CancelToken, ConnectionParams, Lsn, ReplicationConnection, WalBuffer,
};

/// Where to connect and which run-time parameters to set.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub connection_string: String,
    pub properties: BTreeMap<String, String>,
}

/// What to stream once a replication connection is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub slot: SlotName,
    pub start: Lsn,
    /// Output plugin options, in the order they are sent.
    pub options: Vec<(String, String)>,
    pub status_interval: Duration,
}

/// Short-lived SQL connection for slot and DDL management.
pub trait ControlConnection: Send {
    fn execute(&mut self, sql: &str) -> impl Future<Output = PgResult<()>> + Send;

    fn create_slot(&mut self, slot: &SlotName) -> impl Future<Output = PgResult<()>> + Send;

    fn drop_slot(&mut self, slot: &SlotName) -> impl Future<Output = PgResult<()>> + Send;
}

/// A replication connection positioned on a slot.
pub trait WalStream: Send {
    type Cancel: CancelHandle;

    /// Next buffer among bytes already received. Never waits on the network.
    fn read_pending(&mut self) -> impl Future<Output = PgResult<Option<WalBuffer>>> + Send;

    /// Wait up to one status interval for the next buffer. Must be cancel safe.
    fn read(&mut self) -> impl Future<Output = PgResult<Option<WalBuffer>>> + Send;

    fn set_applied_lsn(&mut self, lsn: Lsn);

    fn set_flushed_lsn(&mut self, lsn: Lsn);

    fn force_update_status(&mut self) -> impl Future<Output = PgResult<()>> + Send;

    fn cancel_handle(&self) -> Option<Self::Cancel>;

    fn close(self) -> impl Future<Output = PgResult<()>> + Send;
}

/// Interrupts a blocked [`WalStream::read`] from another task.
pub trait CancelHandle: Send + Sync + 'static {
    fn cancel(&self) -> impl Future<Output = PgResult<()>> + Send;
}

/// Opens control and replication connections.
pub trait Backend: Send + Sync + 'static {
    type Control: ControlConnection;
    type Stream: WalStream + 'static;

    fn connect_control(
        &self,
        settings: &ConnectionSettings,
    ) -> impl Future<Output = PgResult<Self::Control>> + Send;

    fn connect_replication(
        &self,
        settings: &ConnectionSettings,
        request: &ReplicationRequest,
    ) -> impl Future<Output = PgResult<Self::Stream>> + Send;
}

/// Backend for a real PostgreSQL server.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgBackend;

/// tokio-postgres client used as a control connection.
pub struct PgControl {
    client: Client,
}

impl ControlConnection for PgControl {
    async fn execute(&mut self, sql: &str) -> PgResult<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn create_slot(&mut self, slot: &SlotName) -> PgResult<()> {
        create_slot(&self.client, slot).await
    }

    async fn drop_slot(&mut self, slot: &SlotName) -> PgResult<()> {
        drop_slot(&self.client, slot).await
    }
}

impl WalStream for ReplicationConnection {
    type Cancel = CancelToken;

    async fn read_pending(&mut self) -> PgResult<Option<WalBuffer>> {
        ReplicationConnection::read_pending(self).await
    }

    async fn read(&mut self) -> PgResult<Option<WalBuffer>> {
        ReplicationConnection::read(self).await
    }

    fn set_applied_lsn(&mut self, lsn: Lsn) {
        ReplicationConnection::set_applied_lsn(self, lsn)
    }

    fn set_flushed_lsn(&mut self, lsn: Lsn) {
        ReplicationConnection::set_flushed_lsn(self, lsn)
    }

    async fn force_update_status(&mut self) -> PgResult<()> {
        ReplicationConnection::force_update_status(self).await
    }

    fn cancel_handle(&self) -> Option<CancelToken> {
        self.cancel_token()
    }

    async fn close(self) -> PgResult<()> {
        ReplicationConnection::close(self).await
    }
}

impl CancelHandle for CancelToken {
    async fn cancel(&self) -> PgResult<()> {
        CancelToken::cancel(self).await
    }
}

impl Backend for PgBackend {
    type Control = PgControl;
    type Stream = ReplicationConnection;

    async fn connect_control(&self, settings: &ConnectionSettings) -> PgResult<PgControl> {
        let client = connect_postgres(&settings.connection_string, &settings.properties).await?;
        Ok(PgControl { client })
    }

    async fn connect_replication(
        &self,
        settings: &ConnectionSettings,
        request: &ReplicationRequest,
    ) -> PgResult<ReplicationConnection> {
        let params = ConnectionParams::parse(&settings.connection_string)?;
        let mut connection =
            ReplicationConnection::connect(&params, &settings.properties, request.status_interval)
                .await?;
        connection
            .start_replication(&request.slot, request.start, &request.options)
            .await?;
        Ok(connection)
    }
}
