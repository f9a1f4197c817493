use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::{ConfigError, GuardError};
use crate::normalize::{Column, Row};

/// Row cap and deadline applied to every execution. Built once from the
/// configuration; individual calls cannot override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionBounds {
    max_rows: usize,
    timeout: Duration,
}

impl ExecutionBounds {
    pub fn new(max_rows: usize, timeout: Duration) -> Result<Self, ConfigError> {
        if max_rows == 0 {
            return Err(ConfigError::Invalid {
                name: "max_rows",
                reason: "must be a positive integer".to_string(),
            });
        }
        if timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "query_timeout",
                reason: "must be a positive number of seconds".to_string(),
            });
        }
        Ok(Self { max_rows, timeout })
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// SQL text plus values bound to its `?` placeholders. Free-text statements
/// never carry parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<String>,
}

impl BoundStatement {
    pub fn text(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Rows returned by one fetch, at most the requested limit.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    /// More rows existed than `max_rows`; only the first `max_rows` are kept.
    pub truncated: bool,
    pub max_rows: usize,
    pub elapsed: Duration,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows_json(&self) -> Vec<serde_json::Value> {
        self.rows.iter().map(|r| r.to_json(&self.columns)).collect()
    }

    /// Values of one column across all rows.
    #[cfg(test)]
    pub fn column_values(&self, name: &str) -> Vec<&crate::normalize::ScalarValue> {
        self.rows
            .iter()
            .filter_map(|r| r.get(&self.columns, name))
            .collect()
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Row, &[Column]) -> bool,
    {
        let columns = &self.columns;
        self.rows.retain(|row| keep(row, columns));
    }
}

/// Hands out database sessions. Implemented over a connection pool in
/// production and by an in-memory fake in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Opens a session with `database` as its default database.
    async fn open(&self, database: &str) -> Result<Self::Session, GuardError>;
}

/// A checked-out connection. Dropping it returns the connection for reuse;
/// [`Session::discard`] closes it instead.
#[async_trait]
pub trait Session: Send + Sized {
    async fn fetch(&mut self, statement: &BoundStatement, limit: usize) -> Result<RowBatch, GuardError>;

    fn discard(self);
}

/// Runs statements that already passed the guard, under [`ExecutionBounds`].
pub struct BoundedExecutor<C> {
    connector: C,
    bounds: ExecutionBounds,
}

impl<C: Connector> BoundedExecutor<C> {
    pub fn new(connector: C, bounds: ExecutionBounds) -> Self {
        Self { connector, bounds }
    }

    pub fn bounds(&self) -> ExecutionBounds {
        self.bounds
    }

    pub async fn execute(&self, database: &str, statement: &BoundStatement) -> Result<ResultSet, GuardError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.bounds.timeout;
        let max_rows = self.bounds.max_rows;

        let mut session = match tokio::time::timeout_at(deadline, self.connector.open(database)).await {
            Ok(session) => session?,
            Err(_) => {
                warn!("Timed out acquiring a connection for database '{database}'");
                return Err(GuardError::ExecutionTimeout(self.bounds.timeout));
            }
        };

        // One extra row tells a full result apart from a truncated one.
        let fetch_limit = max_rows.saturating_add(1);
        let outcome = tokio::time::timeout_at(deadline, session.fetch(statement, fetch_limit)).await;

        let batch = match outcome {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(
                    "Query exceeded {:?} on database '{database}'; closing its connection",
                    self.bounds.timeout
                );
                session.discard();
                return Err(GuardError::ExecutionTimeout(self.bounds.timeout));
            }
        };

        let RowBatch { columns, mut rows } = batch;
        let truncated = rows.len() > max_rows;
        if truncated {
            rows.truncate(max_rows);
            // Unread rows stay on the wire; close rather than drain them.
            session.discard();
        } else {
            drop(session);
        }

        let elapsed = started.elapsed();
        debug!(
            "Fetched {} rows from '{database}' in {:?} (truncated: {truncated})",
            rows.len(),
            elapsed
        );
        Ok(ResultSet {
            columns,
            rows,
            truncated,
            max_rows,
            elapsed,
        })
    }
}
