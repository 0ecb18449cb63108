use thiserror::Error;

/// `query_canceled`: the server honoured a CancelRequest.
pub const QUERY_CANCELED: &str = "57014";
/// `duplicate_object`: the replication slot already exists.
pub const DUPLICATE_OBJECT: &str = "42710";
/// `undefined_object`: the replication slot does not exist.
pub const UNDEFINED_OBJECT: &str = "42704";

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres {severity}: {message} (code: {code})")]
    Db {
        severity: String,
        code: String,
        message: String,
    },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("listener is already running")]
    AlreadyRunning,

    #[error("cannot delete the replication slot while the listener is running")]
    ListenerRunning,

    #[error(transparent)]
    Core(#[from] walcast_core::Error),
}

impl PgError {
    /// SQLSTATE of a database error.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            PgError::Db { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_query_canceled(&self) -> bool {
        self.sql_state() == Some(QUERY_CANCELED)
    }

    pub fn is_duplicate_object(&self) -> bool {
        self.sql_state() == Some(DUPLICATE_OBJECT)
    }

    pub fn is_undefined_object(&self) -> bool {
        self.sql_state() == Some(UNDEFINED_OBJECT)
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Keep the SQLSTATE so callers can match on it
        if let Some(db_err) = e.as_db_error() {
            PgError::Db {
                severity: db_err.severity().to_string(),
                code: db_err.code().code().to_string(),
                message: db_err.message().to_string(),
            }
        } else {
            PgError::Connection(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn db(code: &str) -> PgError {
        PgError::Db {
            severity: "ERROR".into(),
            code: code.into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_sql_state_helpers() {
        assert!(db("57014").is_query_canceled());
        assert!(db("42710").is_duplicate_object());
        assert!(db("42704").is_undefined_object());
        assert!(!db("42P01").is_undefined_object());
        assert_eq!(PgError::Connection("reset".into()).sql_state(), None);
    }

    #[test]
    fn test_db_error_display() {
        assert_eq!(db("57014").to_string(), "postgres ERROR: boom (code: 57014)");
    }
}
