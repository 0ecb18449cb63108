//! The listener supervisor: slot lifecycle, the streaming worker, and event publication.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walcast_core::{
    decode_event, Backoff, Emitted, EventFlow, ListenerConfig, Subscriber, TableRegistry, WalEvent,
};

use crate::backend::{
    Backend, CancelHandle, ConnectionSettings, ControlConnection, PgBackend, ReplicationRequest,
    WalStream,
};
use crate::error::{PgError, PgResult};
use crate::replication::Lsn;

/// Lifecycle of a [`WalListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    /// Preparing replica identities and the slot.
    Starting,
    Streaming,
    Stopping,
}

/// wal2json options sent with `START_REPLICATION`.
pub fn wal2json_options<R>(tables: &TableRegistry<R>) -> Vec<(String, String)> {
    [
        ("format-version", "2"),
        ("include-transaction", "false"),
        ("include-timestamp", "true"),
        ("include-types", "false"),
        ("include-typmod", "false"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .chain([("add-tables".to_string(), tables.add_tables_option())])
    .collect()
}

/// Cancel state of the live replication connection.
struct LiveConnection<C> {
    cancelled: bool,
    cancel: Option<C>,
}

impl<C> Default for LiveConnection<C> {
    fn default() -> Self {
        Self {
            cancelled: false,
            cancel: None,
        }
    }
}

type CancelOf<B> = <<B as Backend>::Stream as WalStream>::Cancel;

struct Shared<R, B: Backend> {
    config: ListenerConfig<R>,
    settings: ConnectionSettings,
    backend: B,
    flow: EventFlow<WalEvent<R>>,
    connection: Mutex<LiveConnection<CancelOf<B>>>,
    state: watch::Sender<ListenerState>,
}

struct Job {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

impl Job {
    fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Streams wal2json changes for the registered tables and publishes them to subscribers.
///
/// At most one streaming job runs per listener. The worker reconnects with exponential
/// backoff until [`WalListener::stop`] is called.
pub struct WalListener<R, B: Backend = PgBackend> {
    shared: Arc<Shared<R, B>>,
    job: Mutex<Option<Job>>,
}

impl<R> WalListener<R, PgBackend>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(config: ListenerConfig<R>) -> PgResult<Self> {
        Self::with_backend(config, PgBackend)
    }
}

impl<R, B> WalListener<R, B>
where
    R: Clone + Send + Sync + 'static,
    B: Backend,
{
    pub fn with_backend(config: ListenerConfig<R>, backend: B) -> PgResult<Self> {
        config.validate()?;
        let flow = EventFlow::new(config.flow)?;
        let settings = ConnectionSettings {
            connection_string: config.connection_string.clone(),
            properties: config.properties.clone(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                settings,
                backend,
                flow,
                connection: Mutex::new(LiveConnection::default()),
                state: watch::Sender::new(ListenerState::Idle),
            }),
            job: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ListenerConfig<R> {
        &self.shared.config
    }

    pub fn subscribe(&self) -> Subscriber<WalEvent<R>> {
        self.shared.flow.subscribe()
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Whether a streaming job is active.
    pub async fn is_running(&self) -> bool {
        self.job.lock().await.as_ref().is_some_and(Job::is_active)
    }

    /// Prepare the slot and spawn the streaming worker.
    ///
    /// With no registered tables this logs a warning and does nothing.
    pub async fn start(&self, recreate_slot: bool) -> PgResult<()> {
        let config = &self.shared.config;
        if config.tables.is_empty() {
            warn!(slot = %config.slot_name, "No tables registered, listener not started");
            return Ok(());
        }

        let mut job = self.job.lock().await;
        if job.as_ref().is_some_and(Job::is_active) {
            return Err(PgError::AlreadyRunning);
        }
        if let Some(finished) = job.take() {
            let _ = finished.handle.await;
        }

        self.shared.state.send_replace(ListenerState::Starting);
        if let Err(e) = self.prepare(recreate_slot).await {
            self.shared.state.send_replace(ListenerState::Idle);
            return Err(e);
        }

        *self.shared.connection.lock().await = LiveConnection::default();
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        self.shared.state.send_replace(ListenerState::Streaming);
        let handle = tokio::spawn(stream_loop(shared, stop_rx));
        *job = Some(Job { handle, stop_tx });

        info!(
            slot = %config.slot_name,
            tables = config.tables.len(),
            "Listener started"
        );
        Ok(())
    }

    /// Apply replica identities and make sure the slot exists.
    async fn prepare(&self, recreate_slot: bool) -> PgResult<()> {
        let config = &self.shared.config;
        let mut control = self.shared.backend.connect_control(&self.shared.settings).await?;

        if recreate_slot {
            match control.drop_slot(&config.slot_name).await {
                Ok(()) => info!(slot = %config.slot_name, "Dropped replication slot for recreation"),
                Err(e) if e.is_undefined_object() => {
                    debug!(slot = %config.slot_name, "No replication slot to drop")
                }
                Err(e) => return Err(e),
            }
        }

        for registration in config.tables.iter() {
            let ddl = registration.replica_identity_ddl();
            debug!(table = %registration.table(), ddl = %ddl, "Applying replica identity");
            control.execute(&ddl).await?;
        }

        match control.create_slot(&config.slot_name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate_object() => {
                info!(slot = %config.slot_name, "Using existing replication slot");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the worker and wait for it to exit. Does nothing when idle.
    pub async fn stop(&self) {
        let mut job = self.job.lock().await;
        let Some(Job { handle, stop_tx }) = job.take() else {
            return;
        };

        self.shared.state.send_replace(ListenerState::Stopping);
        let _ = stop_tx.send(true);

        let cancel = {
            let mut live = self.shared.connection.lock().await;
            live.cancelled = true;
            live.cancel.take()
        };
        if let Some(cancel) = cancel {
            if let Err(e) = cancel.cancel().await {
                warn!(error = %e, "Failed to cancel replication connection");
            }
        }

        if let Err(e) = handle.await {
            error!(error = %e, "Listener worker failed");
        }
        self.shared.state.send_replace(ListenerState::Idle);
        info!(slot = %self.shared.config.slot_name, "Listener stopped");
    }

    /// Drop the replication slot. Fails while the listener is running.
    pub async fn delete_slot(&self) -> PgResult<()> {
        let job = self.job.lock().await;
        if job.as_ref().is_some_and(Job::is_active) {
            return Err(PgError::ListenerRunning);
        }

        let slot = &self.shared.config.slot_name;
        let mut control = self.shared.backend.connect_control(&self.shared.settings).await?;
        match control.drop_slot(slot).await {
            Ok(()) => info!(slot = %slot, "Deleted replication slot"),
            Err(e) if e.is_undefined_object() => {
                info!(slot = %slot, "Replication slot does not exist")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Resolves once stop is requested or the listener is gone.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn stream_loop<R, B>(shared: Arc<Shared<R, B>>, mut stop_rx: watch::Receiver<bool>)
where
    R: Clone + Send + Sync + 'static,
    B: Backend,
{
    let config = &shared.config;
    let request = ReplicationRequest {
        slot: config.slot_name.clone(),
        start: Lsn::ZERO,
        options: wal2json_options(&config.tables),
        status_interval: config.status_interval,
    };
    let mut backoff = Backoff::new(config.backoff);
    let mut previous: Option<B::Stream> = None;

    loop {
        let connected = {
            let mut live = shared.connection.lock().await;
            if live.cancelled {
                break;
            }
            if let Some(stream) = previous.take() {
                if let Err(e) = stream.close().await {
                    debug!(error = %e, "Error closing previous replication connection");
                }
            }

            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                connected = shared.backend.connect_replication(&shared.settings, &request) => {
                    if let Ok(stream) = &connected {
                        live.cancel = stream.cancel_handle();
                    }
                    connected
                }
            }
        };

        let outcome = match connected {
            Ok(mut stream) => {
                debug!(slot = %request.slot, "Replication connection established");
                let outcome = consume(&shared, &mut stream, &mut stop_rx, &mut backoff).await;
                previous = Some(stream);
                outcome
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => break,
            Err(e) if e.is_query_canceled() => {
                info!(slot = %request.slot, "Replication cancelled");
                break;
            }
            Err(e) => {
                warn!(
                    slot = %request.slot,
                    error = %e,
                    attempt = backoff.attempt() + 1,
                    "Replication stream failed, reconnecting"
                );
                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    _ = backoff.wait() => {}
                }
            }
        }
    }

    if let Some(stream) = previous.take() {
        if let Err(e) = stream.close().await {
            debug!(error = %e, "Error closing replication connection");
        }
    }
    shared.connection.lock().await.cancel = None;
    shared.state.send_replace(ListenerState::Idle);
}

/// Read, decode, publish and acknowledge until stopped (`Ok`) or the connection fails.
async fn consume<R, B>(
    shared: &Shared<R, B>,
    stream: &mut B::Stream,
    stop_rx: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> PgResult<()>
where
    R: Clone + Send + Sync + 'static,
    B: Backend,
{
    loop {
        let buffer = match stream.read_pending().await? {
            Some(buffer) => buffer,
            None => tokio::select! {
                _ = stopped(stop_rx) => return Ok(()),
                read = stream.read() => match read? {
                    Some(buffer) => buffer,
                    None => continue,
                },
            },
        };

        let lsn = buffer.lsn;
        let decoded = decode_event(&buffer.data).and_then(|event| shared.config.tables.map_event(event));
        match decoded {
            Ok(event) => {
                if let WalEvent::Change { table, payload, .. } = &event {
                    debug!(lsn = %lsn, table = %table, op = payload.op(), "Row change");
                }
                tokio::select! {
                    _ = stopped(stop_rx) => return Ok(()),
                    emitted = shared.flow.emit(event) => {
                        if emitted == Emitted::Dropped {
                            debug!(lsn = %lsn, "Event dropped by overflow policy");
                        }
                    }
                }
            }
            Err(e) => warn!(lsn = %lsn, error = %e, "Skipping undecodable WAL message"),
        }

        stream.set_applied_lsn(lsn);
        stream.set_flushed_lsn(lsn);
        stream.force_update_status().await?;
        backoff.reset();
    }
}
