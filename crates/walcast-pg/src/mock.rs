//! In-memory [`Backend`] for exercising the listener without a server.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use walcast_core::SlotName;

use crate::backend::{
    Backend, CancelHandle, ConnectionSettings, ControlConnection, ReplicationRequest, WalStream,
};
use crate::error::{PgError, PgResult, DUPLICATE_OBJECT, QUERY_CANCELED, UNDEFINED_OBJECT};
use crate::replication::{Lsn, WalBuffer};

/// One scripted event on a mock replication connection.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver a WAL buffer.
    Data(WalBuffer),
    /// Fail the read as if the socket dropped.
    Disconnect(String),
    /// Fail the read with a server error.
    DbError { code: String, message: String },
}

impl MockStep {
    pub fn data(lsn: u64, json: impl Into<Bytes>) -> Self {
        MockStep::Data(WalBuffer {
            lsn: Lsn(lsn),
            data: json.into(),
        })
    }

    fn into_error(self) -> Option<PgError> {
        match self {
            MockStep::Data(_) => None,
            MockStep::Disconnect(reason) => Some(PgError::Connection(reason)),
            MockStep::DbError { code, message } => Some(db_error(&code, message)),
        }
    }
}

#[derive(Debug)]
enum Script {
    Refuse(String),
    Steps(Vec<MockStep>),
}

#[derive(Default)]
struct MockState {
    /// Replication slots that exist.
    slots: BTreeSet<String>,
    /// SQL run on control connections.
    statements: Vec<String>,
    /// If set, every control statement fails with this SQLSTATE.
    statement_error: Option<String>,
    control_connects: usize,
    /// One script per replication connection; an empty queue yields idle connections.
    scripts: VecDeque<Script>,
    replication_connects: Vec<Instant>,
    requests: Vec<ReplicationRequest>,
    applied: Vec<Lsn>,
    flushed: Vec<Lsn>,
    status_updates: usize,
    cancels: usize,
    closed: usize,
}

/// Scripted backend recording every interaction.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the slot already exists.
    pub fn with_slot(self, slot: &str) -> Self {
        self.state.lock().unwrap().slots.insert(slot.to_string());
        self
    }

    /// Queue the steps the next replication connection plays back. Once they run out the
    /// connection idles until cancelled.
    pub fn push_connection(&self, steps: impl IntoIterator<Item = MockStep>) {
        let mut state = self.state.lock().unwrap();
        state.scripts.push_back(Script::Steps(steps.into_iter().collect()));
    }

    /// Make the next replication connection attempt fail.
    pub fn push_refused_connection(&self, reason: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.scripts.push_back(Script::Refuse(reason.into()));
    }

    /// Fail every control statement with the given SQLSTATE.
    pub fn fail_statements(&self, code: impl Into<String>) {
        self.state.lock().unwrap().statement_error = Some(code.into());
    }

    pub fn slot_exists(&self, slot: &str) -> bool {
        self.state.lock().unwrap().slots.contains(slot)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn control_connects(&self) -> usize {
        self.state.lock().unwrap().control_connects
    }

    pub fn replication_connects(&self) -> usize {
        self.state.lock().unwrap().replication_connects.len()
    }

    /// When each replication connection was opened.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().replication_connects.clone()
    }

    pub fn requests(&self) -> Vec<ReplicationRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn applied_lsns(&self) -> Vec<Lsn> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn flushed_lsns(&self) -> Vec<Lsn> {
        self.state.lock().unwrap().flushed.clone()
    }

    pub fn status_updates(&self) -> usize {
        self.state.lock().unwrap().status_updates
    }

    pub fn cancels(&self) -> usize {
        self.state.lock().unwrap().cancels
    }

    pub fn closed_connections(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

fn db_error(code: &str, message: impl Into<String>) -> PgError {
    PgError::Db {
        severity: "ERROR".into(),
        code: code.into(),
        message: message.into(),
    }
}

/// Control connection recording statements and tracking slots.
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    fn run(&self, statement: String) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(statement);
        match &state.statement_error {
            Some(code) => Err(db_error(code, "statement failed")),
            None => Ok(()),
        }
    }
}

impl ControlConnection for MockControl {
    async fn execute(&mut self, sql: &str) -> PgResult<()> {
        self.run(sql.to_string())
    }

    async fn create_slot(&mut self, slot: &SlotName) -> PgResult<()> {
        self.run(format!(
            "SELECT pg_create_logical_replication_slot('{}', 'wal2json')",
            slot
        ))?;
        let mut state = self.state.lock().unwrap();
        if !state.slots.insert(slot.to_string()) {
            return Err(db_error(
                DUPLICATE_OBJECT,
                format!("replication slot \"{}\" already exists", slot),
            ));
        }
        Ok(())
    }

    async fn drop_slot(&mut self, slot: &SlotName) -> PgResult<()> {
        self.run(format!("SELECT pg_drop_replication_slot('{}')", slot))?;
        let mut state = self.state.lock().unwrap();
        if !state.slots.remove(slot.as_str()) {
            return Err(db_error(
                UNDEFINED_OBJECT,
                format!("replication slot \"{}\" does not exist", slot),
            ));
        }
        Ok(())
    }
}

/// Cancel flag shared between a mock stream and its handle.
#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

#[derive(Clone)]
pub struct MockCancel {
    signal: Arc<CancelSignal>,
    state: Arc<Mutex<MockState>>,
}

impl CancelHandle for MockCancel {
    async fn cancel(&self) -> PgResult<()> {
        self.state.lock().unwrap().cancels += 1;
        self.signal.cancelled.store(true, Ordering::SeqCst);
        self.signal.notify.notify_waiters();
        Ok(())
    }
}

/// Replication stream playing back a script.
pub struct MockStream {
    steps: VecDeque<MockStep>,
    signal: Arc<CancelSignal>,
    state: Arc<Mutex<MockState>>,
}

impl MockStream {
    fn next_step(&mut self) -> PgResult<Option<WalBuffer>> {
        match self.steps.pop_front() {
            None => Ok(None),
            Some(MockStep::Data(buffer)) => Ok(Some(buffer)),
            Some(step) => Err(step
                .into_error()
                .unwrap_or_else(|| PgError::Protocol("unexpected mock step".into()))),
        }
    }
}

impl WalStream for MockStream {
    type Cancel = MockCancel;

    async fn read_pending(&mut self) -> PgResult<Option<WalBuffer>> {
        self.next_step()
    }

    async fn read(&mut self) -> PgResult<Option<WalBuffer>> {
        if !self.steps.is_empty() {
            return self.next_step();
        }
        // Idle until cancelled, like a server with no new WAL.
        loop {
            let notified = self.signal.notify.notified();
            if self.signal.cancelled.load(Ordering::SeqCst) {
                return Err(db_error(
                    QUERY_CANCELED,
                    "canceling statement due to user request",
                ));
            }
            notified.await;
        }
    }

    fn set_applied_lsn(&mut self, lsn: Lsn) {
        self.state.lock().unwrap().applied.push(lsn);
    }

    fn set_flushed_lsn(&mut self, lsn: Lsn) {
        self.state.lock().unwrap().flushed.push(lsn);
    }

    async fn force_update_status(&mut self) -> PgResult<()> {
        self.state.lock().unwrap().status_updates += 1;
        Ok(())
    }

    fn cancel_handle(&self) -> Option<MockCancel> {
        Some(MockCancel {
            signal: Arc::clone(&self.signal),
            state: Arc::clone(&self.state),
        })
    }

    async fn close(self) -> PgResult<()> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

impl Backend for MockBackend {
    type Control = MockControl;
    type Stream = MockStream;

    async fn connect_control(&self, _settings: &ConnectionSettings) -> PgResult<MockControl> {
        self.state.lock().unwrap().control_connects += 1;
        Ok(MockControl {
            state: Arc::clone(&self.state),
        })
    }

    async fn connect_replication(
        &self,
        _settings: &ConnectionSettings,
        request: &ReplicationRequest,
    ) -> PgResult<MockStream> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.replication_connects.push(Instant::now());
            state.requests.push(request.clone());
            state.scripts.pop_front()
        };

        let steps = match script {
            Some(Script::Refuse(reason)) => return Err(PgError::Connection(reason)),
            Some(Script::Steps(steps)) => steps.into(),
            None => VecDeque::new(),
        };

        Ok(MockStream {
            steps,
            signal: Arc::new(CancelSignal::default()),
            state: Arc::clone(&self.state),
        })
    }
}
