//! Error types for the connectivity core.
//!
//! Every failure surfaces as one `DbError` family. Engine errors are kept as the
//! `source` of the variant they were classified into, so callers can tell
//! connectivity failures (retryable, see `db::retry`) from statement failures
//! (never retried) without losing the original driver message.

use thiserror::Error;

/// Boxed engine error kept as the cause of a wrapped failure.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection not established: {message}")]
    ConnectionNotEstablished {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("Connectivity error: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("Statement error: {message}")]
    Statement {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        #[source]
        source: Option<Cause>,
    },

    #[error("Isolation level {level} is not supported: {message}")]
    IsolationUnsupported { level: String, message: String },

    #[error("Savepoint not found: {name}")]
    SavepointNotFound { name: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("Type conversion failed: {message}")]
    Marshal { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a "no connection could be obtained" error.
    pub fn not_established(message: impl Into<String>) -> Self {
        Self::ConnectionNotEstablished {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a factory failure: no connection exists and none could be created.
    ///
    /// Configuration errors are kept as they are.
    pub fn not_established_by(err: DbError) -> Self {
        match err {
            err @ (Self::Configuration { .. } | Self::ConnectionNotEstablished { .. }) => err,
            other => Self::ConnectionNotEstablished {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Create a connectivity error without an engine cause.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    /// Reclassify an error as a connectivity failure, keeping it as the cause.
    ///
    /// Used once the validity check has shown that the connection behind a failed
    /// unit of work is broken.
    pub fn into_connectivity(self) -> Self {
        match self {
            err @ Self::Connectivity { .. } => err,
            Self::Statement {
                message, source, ..
            } => Self::Connectivity { message, source },
            other => Self::Connectivity {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            source: None,
        }
    }

    /// Create an unsupported isolation level error.
    pub fn isolation_unsupported(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IsolationUnsupported {
            level: level.into(),
            message: message.into(),
        }
    }

    /// Create a savepoint not found error.
    pub fn savepoint_not_found(name: impl Into<String>) -> Self {
        Self::SavepointNotFound { name: name.into() }
    }

    /// Create a configuration error with a helpful suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an invalid identifier error.
    pub fn invalid_identifier(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Create a type conversion error.
    pub fn marshal(message: impl Into<String>) -> Self {
        Self::Marshal {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::ConnectionNotEstablished { .. } => {
                Some("Check the connection URL, credentials and that the server is reachable")
            }
            Self::SavepointNotFound { .. } => {
                Some("Savepoints are cleared by commit and rollback; create it again first")
            }
            _ => None,
        }
    }

    /// SQLSTATE reported by the engine, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Statement { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if the driver already classified this error as a connectivity failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::ConnectionNotEstablished { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Timeout { .. })
    }
}

fn driver_connectivity(message: String, err: sqlx::Error) -> DbError {
    DbError::Connectivity {
        message,
        source: Some(Box::new(err)),
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(ref db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                DbError::Statement {
                    message,
                    sql_state,
                    source: Some(Box::new(err)),
                }
            }
            sqlx::Error::RowNotFound => DbError::statement("No rows returned", None),
            sqlx::Error::Io(ref io_err) => {
                let message = format!("I/O error: {}", io_err);
                driver_connectivity(message, err)
            }
            sqlx::Error::Tls(ref tls_err) => {
                let message = format!("TLS error: {}", tls_err);
                driver_connectivity(message, err)
            }
            sqlx::Error::Protocol(ref msg) => {
                let message = format!("Protocol error: {}", msg);
                driver_connectivity(message, err)
            }
            sqlx::Error::PoolTimedOut => {
                driver_connectivity("Connection pool acquire timed out".to_string(), err)
            }
            sqlx::Error::PoolClosed => {
                driver_connectivity("Connection pool is closed".to_string(), err)
            }
            sqlx::Error::WorkerCrashed => {
                driver_connectivity("Database worker crashed".to_string(), err)
            }
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::marshal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::marshal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::marshal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::marshal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::marshal(format!("Decode error: {}", source)),
            sqlx::Error::Encode(source) => DbError::marshal(format!("Encode error: {}", source)),
            sqlx::Error::AnyDriverError(ref inner) => {
                let message = format!("Driver error: {}", inner);
                driver_connectivity(message, err)
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = DbError::not_established("no url");
        assert!(err.to_string().contains("Connection not established"));
    }

    #[test]
    fn test_not_established_by_keeps_configuration() {
        let err = DbError::not_established_by(DbError::configuration("no url", "set url"));
        assert!(matches!(err, DbError::Configuration { .. }));

        let err = DbError::not_established_by(DbError::connectivity("refused"));
        assert!(matches!(err, DbError::ConnectionNotEstablished { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::configuration("missing url", "Set the 'url' key");
        assert_eq!(err.suggestion(), Some("Set the 'url' key"));
        assert!(DbError::statement("boom", None).suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("ping", 5).is_retryable());
        assert!(DbError::connectivity("reset").is_retryable());
        assert!(!DbError::statement("syntax", Some("42601".into())).is_retryable());
        assert!(!DbError::savepoint_not_found("sp").is_retryable());
    }

    #[test]
    fn test_sqlx_io_error_is_connectivity() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DbError::from(sqlx::Error::Io(io));
        assert!(err.is_connectivity());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("reset by peer"));
    }

    #[test]
    fn test_sqlx_pool_closed_is_connectivity() {
        assert!(DbError::from(sqlx::Error::PoolClosed).is_connectivity());
    }

    #[test]
    fn test_row_not_found_is_statement() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Statement { .. }));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_into_connectivity_keeps_message() {
        let err = DbError::statement("server closed the connection", Some("08006".into()));
        let reclassified = err.into_connectivity();
        assert!(matches!(reclassified, DbError::Connectivity { .. }));
        assert!(reclassified.to_string().contains("server closed"));
    }

    #[test]
    fn test_into_connectivity_wraps_other_errors() {
        let err = DbError::marshal("bad column").into_connectivity();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = DbError::statement("syntax error", Some("42601".to_string()));
        assert_eq!(err.sql_state(), Some("42601"));
        assert_eq!(DbError::internal("x").sql_state(), None);
    }
}
