pub mod backend;
mod connect;
mod error;
pub mod listener;
pub mod mock;
pub mod replication;

pub use backend::{
    Backend, CancelHandle, ConnectionSettings, ControlConnection, PgBackend, ReplicationRequest,
    WalStream,
};
pub use connect::connect_postgres;
pub use error::{PgError, PgResult, DUPLICATE_OBJECT, QUERY_CANCELED, UNDEFINED_OBJECT};
pub use listener::{wal2json_options, ListenerState, WalListener};
pub use replication::{format_lsn, parse_lsn, Lsn, WalBuffer};
