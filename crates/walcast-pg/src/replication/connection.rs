//! Replication-mode connection speaking the streaming replication protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use postgres_protocol::message::backend::Message;
use postgres_protocol::message::frontend;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tracing::{debug, info, warn};
use walcast_core::SlotName;

use super::auth::authenticate;
use super::lsn::Lsn;
use super::params::ConnectionParams;
use super::protocol::{
    db_error, next_message, pg_now_micros, standby_status_update, BackendMessage,
    ReplicationMessage, StandbyStatus,
};
use crate::connect::tls_connector;
use crate::error::{PgError, PgResult};

/// Startup parameters owned by the connection itself.
const RESERVED_PARAMS: &[&str] = &["user", "database", "replication"];

/// One XLogData payload and the WAL position it starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBuffer {
    pub lsn: Lsn,
    pub data: Bytes,
}

pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Buffered backend messages over a plain or TLS socket.
pub(crate) struct WireStream {
    transport: Box<dyn Transport>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl WireStream {
    /// Open a socket, negotiating TLS when the sslmode requires it.
    pub(crate) async fn open(params: &ConnectionParams) -> PgResult<Self> {
        let mut tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| {
                PgError::Connection(format!("{}:{}: {}", params.host, params.port, e))
            })?;
        tcp.set_nodelay(true)?;

        let transport: Box<dyn Transport> = if params.sslmode.requires_tls() {
            let mut request = BytesMut::new();
            frontend::ssl_request(&mut request);
            tcp.write_all(&request).await?;

            match tcp.read_u8().await? {
                b'S' => {
                    let mut connector = tls_connector()?;
                    let tls = MakeTlsConnect::<TcpStream>::make_tls_connect(
                        &mut connector,
                        &params.host,
                    )
                    .map_err(|e| PgError::Tls(e.to_string()))?;
                    let stream = tls
                        .connect(tcp)
                        .await
                        .map_err(|e| PgError::Tls(e.to_string()))?;
                    Box::new(stream)
                }
                b'N' => return Err(PgError::Tls("server does not support TLS".into())),
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected SSLRequest response '{}'",
                        other as char
                    )))
                }
            }
        } else {
            Box::new(tcp)
        };

        Ok(Self {
            transport,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::new(),
        })
    }

    pub(crate) fn write_buf(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Send everything queued in the write buffer.
    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        self.transport.write_all(&self.write_buf).await?;
        self.transport.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Next message if one is already buffered.
    pub(crate) fn try_recv(&mut self) -> PgResult<Option<BackendMessage>> {
        next_message(&mut self.read_buf)
    }

    /// Read from the socket once. Cancel safe.
    pub(crate) async fn fill(&mut self) -> PgResult<()> {
        self.read_buf.reserve(8192);
        let n = self.transport.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(PgError::Connection("connection closed by server".into()));
        }
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            self.fill().await?;
        }
    }

    async fn shutdown(&mut self) -> PgResult<()> {
        self.transport.shutdown().await?;
        Ok(())
    }
}

/// Interrupts the statement running on a replication connection.
#[derive(Debug, Clone)]
pub struct CancelToken {
    params: ConnectionParams,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    /// Send a CancelRequest on a side connection.
    pub async fn cancel(&self) -> PgResult<()> {
        debug!(pid = self.process_id, "Sending cancel request");
        let mut wire = WireStream::open(&self.params).await?;
        frontend::cancel_request(self.process_id, self.secret_key, wire.write_buf());
        wire.flush().await?;
        wire.shutdown().await
    }
}

/// A connection in `replication=database` mode.
pub struct ReplicationConnection {
    wire: WireStream,
    cancel: Option<CancelToken>,
    status: StandbyStatus,
    status_interval: Duration,
    last_status: Instant,
}

impl ReplicationConnection {
    /// Connect and authenticate. `properties` are sent as startup parameters.
    pub async fn connect(
        params: &ConnectionParams,
        properties: &BTreeMap<String, String>,
        status_interval: Duration,
    ) -> PgResult<Self> {
        debug!(?params, "Opening replication connection");
        let mut wire = WireStream::open(params).await?;

        let mut startup = vec![
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
            ("client_encoding", "UTF8"),
        ];
        for (key, value) in properties {
            if RESERVED_PARAMS.contains(&key.as_str()) {
                warn!(property = %key, "Ignoring reserved connection property");
                continue;
            }
            startup.retain(|(k, _)| *k != key.as_str());
            startup.push((key.as_str(), value.as_str()));
        }
        frontend::startup_message(startup, wire.write_buf())?;
        wire.flush().await?;

        authenticate(&mut wire, params).await?;

        let mut cancel = None;
        loop {
            match wire.recv().await? {
                BackendMessage::Message(Message::BackendKeyData(body)) => {
                    cancel = Some(CancelToken {
                        params: params.clone(),
                        process_id: body.process_id(),
                        secret_key: body.secret_key(),
                    });
                }
                BackendMessage::Message(Message::ReadyForQuery(_)) => break,
                BackendMessage::Message(Message::ErrorResponse(body)) => {
                    return Err(db_error(body.fields()))
                }
                _ => {}
            }
        }

        Ok(Self {
            wire,
            cancel,
            status: StandbyStatus::default(),
            status_interval,
            last_status: Instant::now(),
        })
    }

    /// Issue `START_REPLICATION` on a logical slot and enter CopyBoth mode.
    pub async fn start_replication(
        &mut self,
        slot: &SlotName,
        start: Lsn,
        options: &[(String, String)],
    ) -> PgResult<()> {
        let query = start_replication_query(slot, start, options);
        info!(slot = %slot, start_lsn = %start, "Starting logical replication");
        debug!(query = %query, "START_REPLICATION");

        frontend::query(&query, self.wire.write_buf())?;
        self.wire.flush().await?;

        loop {
            match self.wire.recv().await? {
                BackendMessage::CopyBothResponse => {
                    self.last_status = Instant::now();
                    return Ok(());
                }
                BackendMessage::Message(Message::ErrorResponse(body)) => {
                    return Err(db_error(body.fields()))
                }
                _ => {}
            }
        }
    }

    /// Next WAL buffer among bytes already received, without touching the socket for reads.
    pub async fn read_pending(&mut self) -> PgResult<Option<WalBuffer>> {
        while let Some(msg) = self.wire.try_recv()? {
            if let Some(buffer) = self.handle(msg).await? {
                return Ok(Some(buffer));
            }
        }
        Ok(None)
    }

    /// Wait for the next WAL buffer. Returns `None` after sending a status update if
    /// nothing arrived within the status interval. Cancel safe.
    pub async fn read(&mut self) -> PgResult<Option<WalBuffer>> {
        if let Some(buffer) = self.read_pending().await? {
            return Ok(Some(buffer));
        }

        let deadline = self.last_status + self.status_interval;
        loop {
            match tokio::time::timeout_at(deadline, self.wire.fill()).await {
                Ok(filled) => {
                    filled?;
                    if let Some(buffer) = self.read_pending().await? {
                        return Ok(Some(buffer));
                    }
                }
                Err(_) => {
                    self.send_status(false).await?;
                    return Ok(None);
                }
            }
        }
    }

    pub fn set_applied_lsn(&mut self, lsn: Lsn) {
        self.status.applied = self.status.applied.max(lsn);
        self.status.received = self.status.received.max(lsn);
    }

    pub fn set_flushed_lsn(&mut self, lsn: Lsn) {
        self.status.flushed = self.status.flushed.max(lsn);
        self.status.received = self.status.received.max(lsn);
    }

    /// Send a standby status update now.
    pub async fn force_update_status(&mut self) -> PgResult<()> {
        self.send_status(false).await
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    /// End the copy stream and terminate the session.
    pub async fn close(mut self) -> PgResult<()> {
        frontend::copy_done(self.wire.write_buf());
        frontend::terminate(self.wire.write_buf());
        self.wire.flush().await?;
        self.wire.shutdown().await
    }

    async fn handle(&mut self, msg: BackendMessage) -> PgResult<Option<WalBuffer>> {
        let BackendMessage::Message(msg) = msg else {
            return Ok(None);
        };
        match msg {
            Message::CopyData(body) => match ReplicationMessage::parse(body.into_bytes())? {
                ReplicationMessage::XLogData {
                    wal_start,
                    wal_end,
                    data,
                    ..
                } => {
                    self.status.received = self.status.received.max(wal_start).max(wal_end);
                    Ok(Some(WalBuffer {
                        lsn: wal_start,
                        data,
                    }))
                }
                ReplicationMessage::PrimaryKeepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    self.status.received = self.status.received.max(wal_end);
                    if reply_requested {
                        self.send_status(false).await?;
                    }
                    Ok(None)
                }
            },
            Message::ErrorResponse(body) => Err(db_error(body.fields())),
            Message::CopyDone => Err(PgError::Connection(
                "server ended the replication stream".into(),
            )),
            Message::NoticeResponse(body) => {
                debug!(notice = %db_error(body.fields()), "Server notice");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn send_status(&mut self, reply_requested: bool) -> PgResult<()> {
        standby_status_update(
            self.status,
            pg_now_micros(),
            reply_requested,
            self.wire.write_buf(),
        )?;
        self.wire.flush().await?;
        self.last_status = Instant::now();
        debug!(
            received = %self.status.received,
            flushed = %self.status.flushed,
            applied = %self.status.applied,
            "Sent standby status update"
        );
        Ok(())
    }
}

/// `START_REPLICATION SLOT "<slot>" LOGICAL <lsn> (<options>)`.
pub fn start_replication_query(slot: &SlotName, start: Lsn, options: &[(String, String)]) -> String {
    let mut query = format!(
        "START_REPLICATION SLOT {} LOGICAL {}",
        slot.quoted(),
        start
    );
    if !options.is_empty() {
        let rendered = options
            .iter()
            .map(|(key, value)| format!("\"{}\" '{}'", key, value.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        query.push_str(&format!(" ({})", rendered));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_replication_query() {
        let slot = SlotName::parse("walcast").unwrap();
        let options = vec![
            ("format-version".to_string(), "2".to_string()),
            ("add-tables".to_string(), "public.orders,public.users".to_string()),
        ];

        assert_eq!(
            start_replication_query(&slot, Lsn::ZERO, &options),
            r#"START_REPLICATION SLOT "walcast" LOGICAL 0/0 ("format-version" '2', "add-tables" 'public.orders,public.users')"#
        );
        assert_eq!(
            start_replication_query(&slot, Lsn(0x16B3748), &[]),
            r#"START_REPLICATION SLOT "walcast" LOGICAL 0/16B3748"#
        );
    }

    #[test]
    fn test_start_replication_query_escapes_quotes() {
        let slot = SlotName::parse("s").unwrap();
        let options = vec![("filter".to_string(), "it's".to_string())];
        assert!(start_replication_query(&slot, Lsn::ZERO, &options).ends_with("'it''s')"));
    }
}
