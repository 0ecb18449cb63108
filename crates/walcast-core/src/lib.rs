pub mod backoff;
pub mod config;
pub mod error;
pub mod flow;
pub mod ident;
pub mod identity;
pub mod registry;
pub mod types;
pub mod wal2json;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{ListenerConfig, DEFAULT_STATUS_INTERVAL};
pub use error::{Error, Result};
pub use flow::{BufferOverflow, Emitted, EventFlow, FlowConfig, Subscriber};
pub use ident::{Identifier, SlotName, TableName, MAX_IDENTIFIER_LEN};
pub use identity::ReplicaIdentity;
pub use registry::{RowMapper, TableRegistration, TableRegistry};
pub use types::{ChangePayload, FieldMap, MetaData, Value, WalEvent};
pub use wal2json::{decode_event, WalMessage};
