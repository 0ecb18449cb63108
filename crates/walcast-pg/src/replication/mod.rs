//! Push-based streaming of wal2json changes over PostgreSQL's replication protocol.

mod auth;
pub mod connection;
pub mod lsn;
pub mod params;
pub mod protocol;
pub mod slot;

pub use connection::{start_replication_query, CancelToken, ReplicationConnection, WalBuffer};
pub use lsn::{format_lsn, parse_lsn, Lsn};
pub use params::{ConnectionParams, SslMode};
pub use slot::{create_slot, drop_slot, OUTPUT_PLUGIN};
