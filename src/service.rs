use log::{debug, info};

use crate::access::AccessPolicy;
use crate::catalog::{self, CatalogRequest};
use crate::error::GuardError;
use crate::executor::{BoundStatement, BoundedExecutor, Connector, ExecutionBounds, ResultSet};
use crate::guard::{check_statement, validate_simple_identifier};

/// The read-only query pipeline: guard, access policy, then bounded
/// execution. Nothing reaches the database without passing the first two.
pub struct QueryService<C> {
    policy: AccessPolicy,
    executor: BoundedExecutor<C>,
    default_database: String,
}

impl<C: Connector> QueryService<C> {
    pub fn new(connector: C, bounds: ExecutionBounds, policy: AccessPolicy, default_database: impl Into<String>) -> Self {
        Self {
            policy,
            executor: BoundedExecutor::new(connector, bounds),
            default_database: default_database.into(),
        }
    }

    pub fn bounds(&self) -> ExecutionBounds {
        self.executor.bounds()
    }

    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    /// Runs caller-supplied SQL text against `database`, or the configured
    /// default database.
    pub async fn validate_and_execute(&self, text: &str, database: Option<&str>) -> Result<ResultSet, GuardError> {
        let tokens = check_statement(text).inspect_err(|e| {
            info!("Rejected statement: {} ({})", e.kind(), e);
        })?;
        self.policy.check_references(&tokens)?;

        let database = self.resolve_database(database)?;
        debug!("Executing read-only statement on '{database}'");
        self.executor
            .execute(&database, &BoundStatement::text(text))
            .await
    }

    /// Runs a fixed catalog statement. Results that list several databases
    /// only keep the ones the access policy allows.
    pub async fn fetch_catalog_object(&self, request: &CatalogRequest) -> Result<ResultSet, GuardError> {
        let query = catalog::build(request, &self.default_database, self.bounds().max_rows())?;
        self.policy.check(&query.database)?;
        if let Some(scope) = &query.scope {
            self.policy.check(scope)?;
        }

        debug!("Catalog request {:?} on '{}'", request.kind, query.database);
        let mut result = self.executor.execute(&query.database, &query.statement).await?;
        if let Some(column) = query.database_column {
            let policy = &self.policy;
            result.retain_rows(|row, columns| match row.get(columns, column).and_then(|v| v.as_str()) {
                Some(name) => policy.is_allowed(name),
                None => false,
            });
        }
        Ok(result)
    }

    fn resolve_database(&self, requested: Option<&str>) -> Result<String, GuardError> {
        let database = match requested.map(str::trim) {
            Some(name) if !name.is_empty() => validate_simple_identifier(name)?,
            _ => self.default_database.clone(),
        };
        self.policy.check(&database)?;
        Ok(database)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::catalog::CatalogKind;
    use crate::executor::testing::FakeConnector;

    const NONE: [&str; 0] = [];

    fn service(connector: FakeConnector, policy: AccessPolicy) -> QueryService<FakeConnector> {
        let bounds = ExecutionBounds::new(100, Duration::from_secs(5)).unwrap();
        QueryService::new(connector, bounds, policy, "Sales")
    }

    #[tokio::test]
    async fn test_accepted_statement_runs_on_default_database() {
        let connector = FakeConnector::with_rows(3);
        let svc = service(connector.clone(), AccessPolicy::default());

        let result = svc
            .validate_and_execute("SELECT * FROM dbo.Users", None)
            .await
            .unwrap();
        assert_eq!(result.row_count(), 3);
        let seen = connector.statements();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "Sales");
        assert_eq!(seen[0].1, BoundStatement::text("SELECT * FROM dbo.Users"));
    }

    #[tokio::test]
    async fn test_rejected_statements_never_reach_the_database() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::default());

        for (sql, kind) in [
            ("SELECT 1; DROP TABLE dbo.Users", "MULTIPLE_STATEMENTS"),
            ("INSERT INTO dbo.Users(Username) VALUES('x')", "STATEMENT_NOT_ALLOWED"),
            ("   ", "EMPTY_STATEMENT"),
            ("SELECT 'open", "MALFORMED_INPUT"),
        ] {
            let err = svc.validate_and_execute(sql, None).await.unwrap_err();
            assert_eq!(err.kind(), kind, "{sql}");
        }
        assert!(connector.statements().is_empty());
        assert_eq!(connector.counters.opened(), 0);
    }

    #[tokio::test]
    async fn test_scenario_database_not_allowed() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::new(["Sales"], NONE));

        let err = svc.validate_and_execute("SELECT 1", Some("HR")).await.unwrap_err();
        assert_eq!(err, GuardError::DatabaseNotAllowed("HR".into()));
        assert!(svc.validate_and_execute("SELECT 1", Some("sales")).await.is_ok());
        assert_eq!(connector.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_database_named_in_text() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::new(NONE, ["hr"]));

        let err = svc
            .validate_and_execute("SELECT * FROM hr.salaries", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DATABASE_NOT_ALLOWED");
        assert!(connector.statements().is_empty());
    }

    #[tokio::test]
    async fn test_qualified_table_outside_allow_list() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::new(["Sales"], NONE));

        let err = svc
            .validate_and_execute("SELECT * FROM HR.salaries", None)
            .await
            .unwrap_err();
        assert_eq!(err, GuardError::DatabaseNotAllowed("HR".into()));
        assert!(connector.statements().is_empty());

        assert!(svc
            .validate_and_execute("SELECT s.* FROM sales.orders s", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_database_argument_is_an_identifier() {
        let svc = service(FakeConnector::with_rows(1), AccessPolicy::default());
        let err = svc
            .validate_and_execute("SELECT 1", Some("Sales`; DROP DATABASE x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_IDENTIFIER");
    }

    #[tokio::test]
    async fn test_catalog_scope_is_access_checked() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::new(NONE, ["hr"]));

        let request = CatalogRequest::new(CatalogKind::TableColumns).name("hr.salaries");
        let err = svc.fetch_catalog_object(&request).await.unwrap_err();
        assert_eq!(err, GuardError::DatabaseNotAllowed("hr".into()));

        let request = CatalogRequest::new(CatalogKind::Tables).database(Some("HR".into()));
        assert!(svc.fetch_catalog_object(&request).await.is_err());
        assert!(connector.statements().is_empty());
    }

    #[tokio::test]
    async fn test_search_with_bracketed_database_name() {
        let connector = FakeConnector::with_rows(1);
        let svc = service(connector.clone(), AccessPolicy::new(["Sales"], NONE));

        let request = CatalogRequest::new(CatalogKind::SearchObjects)
            .pattern(Some("order".into()))
            .database(Some("[Sales]".into()));
        assert!(svc.fetch_catalog_object(&request).await.is_ok());

        let (database, statement) = &connector.statements()[0];
        assert_eq!(database, "Sales");
        assert_eq!(statement.params.last().map(String::as_str), Some("Sales"));
    }

    #[tokio::test]
    async fn test_database_listing_is_filtered_by_policy() {
        let connector = FakeConnector::with_rows(4);
        let svc = service(connector.clone(), AccessPolicy::new(NONE, ["db1", "db3"]));

        let result = svc
            .fetch_catalog_object(&CatalogRequest::new(CatalogKind::Databases))
            .await
            .unwrap();
        let names: Vec<_> = result
            .column_values("database_name")
            .into_iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(names, vec!["db0", "db2"]);

        let (database, statement) = &connector.statements()[0];
        assert_eq!(database, "Sales");
        assert_eq!(statement.params, vec!["%".to_string()]);
    }

    #[tokio::test]
    async fn test_catalog_names_are_bound_not_interpolated() {
        let connector = FakeConnector::with_rows(0);
        let svc = service(connector.clone(), AccessPolicy::default());

        let request = CatalogRequest::new(CatalogKind::ViewDefinition).name("reporting.v_orders");
        let result = svc.fetch_catalog_object(&request).await.unwrap();
        assert_eq!(result.row_count(), 0);

        let (database, statement) = &connector.statements()[0];
        assert_eq!(database, "Sales");
        assert!(!statement.sql.contains("v_orders"));
        assert_eq!(statement.params, vec!["reporting".to_string(), "v_orders".to_string()]);
    }
}
