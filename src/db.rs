use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use log::{error, info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, Pool};

use crate::error::GuardError;
use crate::executor::{BoundStatement, Connector, RowBatch, Session};
use crate::guard::identifier::{quote_part, validate_simple_identifier};
use crate::normalize::{columns_of, normalize_row};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY_MS: u64 = 1000;

/// SQL modes under which the server reads `\` or `"` differently from the
/// statement guard's lexer. The composite modes imply ANSI_QUOTES.
const GUARD_INCOMPATIBLE_MODES: &[&str] = &[
    "NO_BACKSLASH_ESCAPES",
    "ANSI_QUOTES",
    "ANSI",
    "DB2",
    "MAXDB",
    "MSSQL",
    "ORACLE",
    "POSTGRESQL",
];

/// Connects to MySQL, retrying a few times while the server comes up. Every
/// pooled connection is put into read-only transaction mode and gets an SQL
/// mode the statement guard lexes the same way the server does.
pub async fn connect_with_retry(
    options: MySqlConnectOptions,
    max_connections: u32,
) -> Result<Pool<MySql>, sqlx::Error> {
    let mut retry_count = 0;

    loop {
        match MySqlPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    (&mut *conn).execute("SET SESSION TRANSACTION READ ONLY").await?;
                    pin_sql_mode(conn).await
                })
            })
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                info!("Successfully connected to MySQL database");
                return Ok(pool);
            }
            Err(e) => {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    error!(
                        "Failed to connect to database after {MAX_RETRIES} retries: {}",
                        describe_driver_error(&e)
                    );
                    return Err(e);
                }
                warn!(
                    "Database connection failed (attempt {retry_count}/{MAX_RETRIES}): {}",
                    describe_driver_error(&e)
                );
                info!("Retrying in {RETRY_DELAY_MS}ms...");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }
}

/// Clears backslash and double-quote modes from the session `sql_mode` and
/// refuses the connection if the server keeps them.
async fn pin_sql_mode(conn: &mut MySqlConnection) -> Result<(), sqlx::Error> {
    let current: String = sqlx::query_scalar("SELECT @@SESSION.sql_mode")
        .fetch_one(&mut *conn)
        .await?;
    if is_guard_compatible(&current) {
        return Ok(());
    }

    sqlx::query("SET SESSION sql_mode = ?")
        .bind(guard_compatible_sql_mode(&current))
        .execute(&mut *conn)
        .await?;

    let effective: String = sqlx::query_scalar("SELECT @@SESSION.sql_mode")
        .fetch_one(&mut *conn)
        .await?;
    if !is_guard_compatible(&effective) {
        error!("Server kept sql_mode '{effective}'; refusing the connection");
        return Err(sqlx::Error::Configuration(
            "sql_mode must not include NO_BACKSLASH_ESCAPES or ANSI_QUOTES".into(),
        ));
    }
    info!("Cleared quoting modes from session sql_mode");
    Ok(())
}

fn sql_modes(mode: &str) -> impl Iterator<Item = &str> {
    mode.split(',').map(str::trim).filter(|m| !m.is_empty())
}

fn is_guard_incompatible(mode: &str) -> bool {
    GUARD_INCOMPATIBLE_MODES.iter().any(|m| mode.eq_ignore_ascii_case(m))
}

fn is_guard_compatible(mode: &str) -> bool {
    !sql_modes(mode).any(is_guard_incompatible)
}

fn guard_compatible_sql_mode(mode: &str) -> String {
    sql_modes(mode)
        .filter(|m| !is_guard_incompatible(m))
        .collect::<Vec<_>>()
        .join(",")
}

/// Hands out pooled MySQL sessions switched to the requested database.
#[derive(Clone)]
pub struct MySqlConnector {
    pool: Pool<MySql>,
    statement_timeout: Duration,
}

impl MySqlConnector {
    /// `statement_timeout` is also enforced server side through
    /// `max_execution_time`, so abandoned SELECTs stop running.
    pub fn new(pool: Pool<MySql>, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    type Session = MySqlSession;

    async fn open(&self, database: &str) -> Result<MySqlSession, GuardError> {
        let database = validate_simple_identifier(database)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| log_driver_error("acquire a connection", &e))?;

        // USE cannot be prepared; it goes over the text protocol.
        let use_database = format!("USE {}", quote_part(&database));
        (&mut *conn)
            .execute(use_database.as_str())
            .await
            .map_err(|e| log_driver_error("select the database", &e))?;

        let millis = self.statement_timeout.as_millis().max(1);
        let limit_time = format!("SET SESSION max_execution_time = {millis}");
        (&mut *conn)
            .execute(limit_time.as_str())
            .await
            .map_err(|e| log_driver_error("set the statement time limit", &e))?;

        Ok(MySqlSession { conn })
    }
}

pub struct MySqlSession {
    conn: PoolConnection<MySql>,
}

#[async_trait]
impl Session for MySqlSession {
    async fn fetch(&mut self, statement: &BoundStatement, limit: usize) -> Result<RowBatch, GuardError> {
        // Parameterised catalog statements are prepared. Free text has no
        // parameters and runs over the text protocol, which also accepts SHOW
        // and DESCRIBE forms the server refuses to prepare.
        let mut rows = if statement.params.is_empty() {
            (&mut *self.conn).fetch(statement.sql.as_str())
        } else {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = query.bind(param.as_str());
            }
            query.fetch(&mut *self.conn)
        };

        let mut batch = RowBatch::default();
        while batch.rows.len() < limit {
            let row = rows
                .try_next()
                .await
                .map_err(|e| log_driver_error("execute the statement", &e))?;
            let Some(row) = row else { break };
            if batch.columns.is_empty() {
                batch.columns = columns_of(&row);
            }
            batch.rows.push(normalize_row(&row, &batch.columns));
        }
        Ok(batch)
    }

    fn discard(mut self) {
        self.conn.close_on_drop();
    }
}

fn log_driver_error(action: &str, err: &sqlx::Error) -> GuardError {
    let sanitized = sanitize_driver_error(err);
    warn!("Failed to {action}: {sanitized}");
    sanitized
}

/// Maps a driver error to [`GuardError::ExecutionFailed`] with a message that
/// is safe to return to callers.
pub fn sanitize_driver_error(err: &sqlx::Error) -> GuardError {
    GuardError::ExecutionFailed(describe_driver_error(err))
}

/// Server messages keep their text and error code with account names
/// scrubbed; transport and driver internals are reduced to a fixed
/// description.
pub fn describe_driver_error(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => format!("{} [{code}]", scrub_accounts(db.message())),
            None => scrub_accounts(db.message()),
        },
        sqlx::Error::PoolTimedOut => "timed out waiting for a database connection".to_string(),
        sqlx::Error::PoolClosed => "the connection pool is closed".to_string(),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            "lost connection to the database server".to_string()
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            "a result value could not be decoded".to_string()
        }
        sqlx::Error::Configuration(_) => "invalid connection settings".to_string(),
        _ => "the database driver reported an error".to_string(),
    }
}

/// Replaces `'user'@'host'` account references with a placeholder.
fn scrub_accounts(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(at) = rest.find("'@'") {
        let (head, tail) = (&rest[..at], &rest[at + 3..]);
        match (head.rfind('\''), tail.find('\'')) {
            (Some(user_start), Some(host_end)) => {
                out.push_str(&head[..user_start]);
                out.push_str("'<account>'");
                rest = &tail[host_end + 1..];
            }
            _ => {
                out.push_str(&rest[..at + 3]);
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}
