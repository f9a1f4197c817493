use std::time::Duration;

use thiserror::Error;

/// Every way a guarded request can fail. The set is closed: callers can match
/// on it exhaustively and [`GuardError::kind`] gives the stable wire name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Statement is empty")]
    EmptyStatement,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Statement not allowed: {0}")]
    StatementNotAllowed(String),

    #[error("Multiple statements are not allowed; submit a single read-only statement")]
    MultipleStatements,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Access to database '{0}' is not allowed")]
    DatabaseNotAllowed(String),

    #[error("Query did not complete within {}s and was cancelled", .0.as_secs_f64())]
    ExecutionTimeout(Duration),

    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),
}

impl GuardError {
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::EmptyStatement => "EMPTY_STATEMENT",
            GuardError::MalformedInput(_) => "MALFORMED_INPUT",
            GuardError::StatementNotAllowed(_) => "STATEMENT_NOT_ALLOWED",
            GuardError::MultipleStatements => "MULTIPLE_STATEMENTS",
            GuardError::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            GuardError::DatabaseNotAllowed(_) => "DATABASE_NOT_ALLOWED",
            GuardError::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            GuardError::ExecutionFailed(_) => "EXECUTION_FAILED",
        }
    }

    /// JSON-RPC error code reported for this failure.
    pub fn code(&self) -> i32 {
        match self {
            GuardError::EmptyStatement
            | GuardError::MalformedInput(_)
            | GuardError::StatementNotAllowed(_)
            | GuardError::MultipleStatements
            | GuardError::InvalidIdentifier(_) => -32602,
            GuardError::DatabaseNotAllowed(_) => -32007,
            GuardError::ExecutionTimeout(_) => -32008,
            GuardError::ExecutionFailed(_) => -32004,
        }
    }

    /// True for rejections decided locally, before any database round-trip.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            GuardError::ExecutionTimeout(_) | GuardError::ExecutionFailed(_)
        )
    }
}

/// Failures of a `tools/call` request before or around the guarded pipeline.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Startup configuration problems. These abort the process before the server
/// accepts requests.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing required setting '{0}' (set it in the config file, on the command line, or via the environment)")]
    Missing(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(GuardError::EmptyStatement.kind(), "EMPTY_STATEMENT");
        assert_eq!(GuardError::MultipleStatements.kind(), "MULTIPLE_STATEMENTS");
        assert_eq!(
            GuardError::DatabaseNotAllowed("HR".into()).kind(),
            "DATABASE_NOT_ALLOWED"
        );
        assert_eq!(
            GuardError::ExecutionTimeout(Duration::from_secs(3)).kind(),
            "EXECUTION_TIMEOUT"
        );
    }

    #[test]
    fn test_rejections_versus_execution_failures() {
        assert!(GuardError::InvalidIdentifier("x;".into()).is_rejection());
        assert!(GuardError::StatementNotAllowed("DROP".into()).is_rejection());
        assert!(!GuardError::ExecutionFailed("lost connection".into()).is_rejection());
        assert!(!GuardError::ExecutionTimeout(Duration::from_secs(1)).is_rejection());
    }

    #[test]
    fn test_timeout_message_reports_seconds() {
        let err = GuardError::ExecutionTimeout(Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Query did not complete within 1.5s and was cancelled"
        );
    }
}
