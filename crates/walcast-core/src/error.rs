use thiserror::Error;

/// Errors that can occur in walcast-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    #[error("invalid replication slot name '{value}': {reason}")]
    InvalidSlotName { value: String, reason: &'static str },

    #[error("invalid table name '{0}': expected schema.table")]
    InvalidTableName(String),

    #[error("invalid replica identity '{0}': expected default, full, nothing or 'using index <name>'")]
    InvalidReplicaIdentity(String),

    #[error("table '{0}' is registered more than once")]
    DuplicateTable(String),

    #[error("invalid flow configuration: {0}")]
    InvalidFlowConfig(String),

    #[error("invalid listener configuration: {0}")]
    InvalidListenerConfig(String),

    #[error("wal2json message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wal2json message has no action field")]
    MissingAction,

    #[error("unsupported wal2json action '{0}'")]
    UnknownAction(String),

    #[error("invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("change for unregistered table '{0}'")]
    UnregisteredTable(String),

    #[error("mapper for table '{table}' failed: {message}")]
    Mapping { table: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
