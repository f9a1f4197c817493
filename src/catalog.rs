//! Fixed catalog statements for listing and describing database objects.
//!
//! Caller input reaches these statements in two ways only: as `?` parameters
//! (names compared against `information_schema`, LIKE patterns, search text)
//! or, where the server needs an identifier, as a name that passed
//! [`validate_identifier`] and was re-quoted with backticks.

use serde::Deserialize;

use crate::error::GuardError;
use crate::executor::BoundStatement;
use crate::guard::identifier::{quote_part, validate_identifier, validate_simple_identifier};

const DEFAULT_SAMPLE_ROWS: usize = 10;

const SYSTEM_SCHEMA_LIST: &str = "('information_schema', 'mysql', 'performance_schema', 'sys')";

const LIST_DATABASES: &str = "\
SELECT s.SCHEMA_NAME AS database_name,
       s.DEFAULT_CHARACTER_SET_NAME AS character_set,
       s.DEFAULT_COLLATION_NAME AS collation_name,
       (SELECT COUNT(*) FROM information_schema.TABLES t
         WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS object_count,
       (SELECT CAST(COALESCE(SUM(t.DATA_LENGTH + t.INDEX_LENGTH), 0) / 1024 / 1024 AS DECIMAL(12,2))
          FROM information_schema.TABLES t
         WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS size_mb
  FROM information_schema.SCHEMATA s
 WHERE s.SCHEMA_NAME LIKE ?";

const SCHEMA_OVERVIEW: &str = "\
SELECT ? AS database_name,
       (SELECT COUNT(*) FROM information_schema.TABLES
         WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE') AS tables,
       (SELECT COUNT(*) FROM information_schema.VIEWS
         WHERE TABLE_SCHEMA = ?) AS views,
       (SELECT COUNT(*) FROM information_schema.ROUTINES
         WHERE ROUTINE_SCHEMA = ? AND ROUTINE_TYPE = 'PROCEDURE') AS procedures,
       (SELECT COUNT(*) FROM information_schema.ROUTINES
         WHERE ROUTINE_SCHEMA = ? AND ROUTINE_TYPE = 'FUNCTION') AS functions,
       (SELECT CAST(COALESCE(SUM(DATA_LENGTH + INDEX_LENGTH), 0) / 1024 / 1024 AS DECIMAL(12,2))
          FROM information_schema.TABLES
         WHERE TABLE_SCHEMA = ?) AS size_mb";

const LIST_TABLES: &str = "\
SELECT t.TABLE_SCHEMA AS schema_name,
       t.TABLE_NAME AS table_name,
       t.ENGINE AS engine,
       t.TABLE_ROWS AS row_count,
       CAST((t.DATA_LENGTH + t.INDEX_LENGTH) / 1024 / 1024 AS DECIMAL(12,2)) AS size_mb,
       t.CREATE_TIME AS create_date,
       t.UPDATE_TIME AS modify_date,
       t.TABLE_COMMENT AS description
  FROM information_schema.TABLES t
 WHERE t.TABLE_SCHEMA = ? AND t.TABLE_TYPE = 'BASE TABLE' AND t.TABLE_NAME LIKE ?
 ORDER BY t.TABLE_NAME";

const OBJECT_COLUMNS: &str = "\
SELECT c.COLUMN_NAME AS column_name,
       c.DATA_TYPE AS data_type,
       c.COLUMN_TYPE AS column_type,
       c.CHARACTER_MAXIMUM_LENGTH AS max_length,
       c.NUMERIC_PRECISION AS `precision`,
       c.NUMERIC_SCALE AS scale,
       c.IS_NULLABLE = 'YES' AS is_nullable,
       c.COLUMN_DEFAULT AS default_value,
       c.COLUMN_KEY AS column_key,
       c.EXTRA AS extra,
       c.GENERATION_EXPRESSION AS computed_definition,
       c.COLUMN_COMMENT AS description
  FROM information_schema.COLUMNS c
  JOIN information_schema.TABLES t
    ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
 WHERE c.TABLE_SCHEMA = ? AND c.TABLE_NAME = ? AND t.TABLE_TYPE = ?
 ORDER BY c.ORDINAL_POSITION";

const TABLE_INDEXES: &str = "\
SELECT s.INDEX_NAME AS index_name,
       s.INDEX_TYPE AS index_type,
       s.NON_UNIQUE = 0 AS is_unique,
       s.INDEX_NAME = 'PRIMARY' AS is_primary_key,
       GROUP_CONCAT(s.COLUMN_NAME ORDER BY s.SEQ_IN_INDEX SEPARATOR ', ') AS column_names
  FROM information_schema.STATISTICS s
 WHERE s.TABLE_SCHEMA = ? AND s.TABLE_NAME = ?
 GROUP BY s.INDEX_NAME, s.INDEX_TYPE, s.NON_UNIQUE
 ORDER BY is_primary_key DESC, s.INDEX_NAME";

const TABLE_RELATIONSHIPS: &str = "\
SELECT CASE WHEN k.TABLE_SCHEMA = ? AND k.TABLE_NAME = ? THEN 'outgoing' ELSE 'incoming' END AS direction,
       k.CONSTRAINT_NAME AS constraint_name,
       k.TABLE_SCHEMA AS parent_schema,
       k.TABLE_NAME AS parent_table,
       k.COLUMN_NAME AS parent_column,
       k.REFERENCED_TABLE_SCHEMA AS referenced_schema,
       k.REFERENCED_TABLE_NAME AS referenced_table,
       k.REFERENCED_COLUMN_NAME AS referenced_column,
       r.DELETE_RULE AS on_delete,
       r.UPDATE_RULE AS on_update
  FROM information_schema.KEY_COLUMN_USAGE k
  JOIN information_schema.REFERENTIAL_CONSTRAINTS r
    ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
   AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
   AND r.TABLE_NAME = k.TABLE_NAME
 WHERE k.REFERENCED_TABLE_NAME IS NOT NULL
   AND ((k.TABLE_SCHEMA = ? AND k.TABLE_NAME = ?)
        OR (k.REFERENCED_TABLE_SCHEMA = ? AND k.REFERENCED_TABLE_NAME = ?))
 ORDER BY direction DESC, k.CONSTRAINT_NAME, k.ORDINAL_POSITION";

const LIST_VIEWS: &str = "\
SELECT v.TABLE_SCHEMA AS schema_name,
       v.TABLE_NAME AS view_name,
       v.IS_UPDATABLE AS is_updatable,
       v.CHECK_OPTION AS check_option,
       v.SECURITY_TYPE AS security_type
  FROM information_schema.VIEWS v
 WHERE v.TABLE_SCHEMA = ? AND v.TABLE_NAME LIKE ?
 ORDER BY v.TABLE_NAME";

const VIEW_DEFINITION: &str = "\
SELECT v.TABLE_SCHEMA AS schema_name,
       v.TABLE_NAME AS view_name,
       v.VIEW_DEFINITION AS definition
  FROM information_schema.VIEWS v
 WHERE v.TABLE_SCHEMA = ? AND v.TABLE_NAME = ?";

const LIST_ROUTINES: &str = "\
SELECT r.ROUTINE_SCHEMA AS schema_name,
       r.ROUTINE_NAME AS routine_name,
       r.ROUTINE_TYPE AS routine_type,
       r.DATA_TYPE AS return_type,
       r.IS_DETERMINISTIC AS is_deterministic,
       r.SQL_DATA_ACCESS AS data_access,
       r.CREATED AS create_date,
       r.LAST_ALTERED AS modify_date,
       r.ROUTINE_COMMENT AS description
  FROM information_schema.ROUTINES r
 WHERE r.ROUTINE_SCHEMA = ? AND r.ROUTINE_TYPE = ? AND r.ROUTINE_NAME LIKE ?
 ORDER BY r.ROUTINE_NAME";

const ROUTINE_DEFINITION: &str = "\
SELECT r.ROUTINE_SCHEMA AS schema_name,
       r.ROUTINE_NAME AS routine_name,
       r.ROUTINE_TYPE AS routine_type,
       r.ROUTINE_DEFINITION AS definition
  FROM information_schema.ROUTINES r
 WHERE r.ROUTINE_SCHEMA = ? AND r.ROUTINE_TYPE = ? AND r.ROUTINE_NAME = ?";

const PROCEDURE_PARAMETERS: &str = "\
SELECT p.PARAMETER_NAME AS parameter_name,
       p.DATA_TYPE AS data_type,
       p.DTD_IDENTIFIER AS full_type,
       p.CHARACTER_MAXIMUM_LENGTH AS max_length,
       p.NUMERIC_PRECISION AS `precision`,
       p.NUMERIC_SCALE AS scale,
       p.PARAMETER_MODE AS direction,
       p.ORDINAL_POSITION AS parameter_id
  FROM information_schema.PARAMETERS p
 WHERE p.SPECIFIC_SCHEMA = ? AND p.SPECIFIC_NAME = ?
   AND p.ROUTINE_TYPE = 'PROCEDURE' AND p.ORDINAL_POSITION > 0
 ORDER BY p.ORDINAL_POSITION";

const SEARCH_OBJECTS: &str = "\
SELECT o.database_name, o.object_name, o.object_type, o.create_date
  FROM (SELECT t.TABLE_SCHEMA AS database_name,
               t.TABLE_NAME AS object_name,
               CASE t.TABLE_TYPE WHEN 'VIEW' THEN 'view' ELSE 'table' END AS object_type,
               t.CREATE_TIME AS create_date
          FROM information_schema.TABLES t
         WHERE t.TABLE_NAME LIKE ?
        UNION ALL
        SELECT r.ROUTINE_SCHEMA, r.ROUTINE_NAME, LOWER(r.ROUTINE_TYPE), r.CREATED
          FROM information_schema.ROUTINES r
         WHERE r.ROUTINE_NAME LIKE ?) o
 WHERE o.object_type IN (?, ?, ?, ?)
   AND (? = '' OR o.database_name = ?)
   AND o.database_name NOT IN ";

const SEARCH_DEFINITIONS: &str = "\
SELECT o.database_name, o.object_name, o.object_type, o.match_position
  FROM (SELECT v.TABLE_SCHEMA AS database_name,
               v.TABLE_NAME AS object_name,
               'view' AS object_type,
               LOCATE(?, v.VIEW_DEFINITION) AS match_position
          FROM information_schema.VIEWS v
        UNION ALL
        SELECT r.ROUTINE_SCHEMA, r.ROUTINE_NAME, LOWER(r.ROUTINE_TYPE), LOCATE(?, r.ROUTINE_DEFINITION)
          FROM information_schema.ROUTINES r) o
 WHERE o.match_position > 0
   AND o.object_type IN (?, ?, ?)
   AND (? = '' OR o.database_name = ?)
   AND o.database_name NOT IN ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Databases,
    SchemaOverview,
    Tables,
    TableDefinition,
    TableColumns,
    TableIndexes,
    TableRelationships,
    Views,
    ViewDefinition,
    ViewColumns,
    Procedures,
    ProcedureDefinition,
    ProcedureParameters,
    Functions,
    FunctionDefinition,
    SampleData,
    SearchObjects,
    SearchDefinitions,
}

impl CatalogKind {
    /// Kinds that describe one named object.
    pub fn requires_name(self) -> bool {
        matches!(
            self,
            CatalogKind::TableDefinition
                | CatalogKind::TableColumns
                | CatalogKind::TableIndexes
                | CatalogKind::TableRelationships
                | CatalogKind::ViewDefinition
                | CatalogKind::ViewColumns
                | CatalogKind::ProcedureDefinition
                | CatalogKind::ProcedureParameters
                | CatalogKind::FunctionDefinition
                | CatalogKind::SampleData
        )
    }

    fn requires_pattern(self) -> bool {
        matches!(self, CatalogKind::SearchObjects | CatalogKind::SearchDefinitions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    View,
    Procedure,
    Function,
}

impl ObjectType {
    fn as_str(self) -> &'static str {
        match self {
            ObjectType::Table => "table",
            ObjectType::View => "view",
            ObjectType::Procedure => "procedure",
            ObjectType::Function => "function",
        }
    }
}

/// What a catalog caller asked for. `database`, `schema` and `name` are
/// identifiers; `pattern` is a value and is only ever bound as a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRequest {
    pub kind: CatalogKind,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub name: Option<String>,
    pub pattern: Option<String>,
    pub include_system: bool,
    pub object_types: Vec<ObjectType>,
    pub sample_rows: Option<usize>,
    pub random: bool,
}

impl CatalogRequest {
    pub fn new(kind: CatalogKind) -> Self {
        Self {
            kind,
            database: None,
            schema: None,
            name: None,
            pattern: None,
            include_system: false,
            object_types: Vec::new(),
            sample_rows: None,
            random: false,
        }
    }

    pub fn database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }

    pub fn schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn pattern(mut self, pattern: Option<String>) -> Self {
        self.pattern = pattern;
        self
    }
}

/// A catalog statement ready for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    /// Database the session connects to.
    pub database: String,
    /// Schema the statement reads from, when it reads from exactly one.
    pub scope: Option<String>,
    /// Result column holding a database name, for results that span databases
    /// and must be filtered by the access policy.
    pub database_column: Option<&'static str>,
    pub statement: BoundStatement,
}

pub fn build(
    request: &CatalogRequest,
    default_database: &str,
    max_rows: usize,
) -> Result<CatalogQuery, GuardError> {
    let database = match &request.database {
        Some(db) => validate_simple_identifier(db)?,
        None => default_database.to_string(),
    };

    let (schema, object) = resolve_target(request, &database)?;
    if request.kind.requires_name() && object.is_none() {
        return Err(GuardError::InvalidIdentifier(
            "an object name is required".to_string(),
        ));
    }
    if request.kind.requires_pattern() && request.pattern.as_deref().map_or(true, str::is_empty) {
        return Err(GuardError::InvalidIdentifier(
            "a search pattern is required".to_string(),
        ));
    }

    let object = object.unwrap_or_default();
    let like = request.pattern.clone().unwrap_or_else(|| "%".to_string());
    let scoped = |statement: BoundStatement| CatalogQuery {
        database: database.clone(),
        scope: Some(schema.clone()),
        database_column: None,
        statement,
    };

    let query = match request.kind {
        CatalogKind::Databases => {
            let mut sql = LIST_DATABASES.to_string();
            if !request.include_system {
                sql.push_str(&format!("\n   AND s.SCHEMA_NAME NOT IN {SYSTEM_SCHEMA_LIST}"));
            }
            sql.push_str("\n ORDER BY s.SCHEMA_NAME");
            CatalogQuery {
                database: database.clone(),
                scope: None,
                database_column: Some("database_name"),
                statement: BoundStatement::with_params(sql, vec![like]),
            }
        }
        CatalogKind::SchemaOverview => scoped(BoundStatement::with_params(
            SCHEMA_OVERVIEW,
            vec![schema.clone(); 6],
        )),
        CatalogKind::Tables => scoped(BoundStatement::with_params(
            LIST_TABLES,
            vec![schema.clone(), like],
        )),
        CatalogKind::TableDefinition => scoped(BoundStatement::text(format!(
            "SHOW CREATE TABLE {}",
            quoted_pair(&schema, &object)
        ))),
        CatalogKind::TableColumns | CatalogKind::ViewColumns => {
            let table_type = if request.kind == CatalogKind::ViewColumns {
                "VIEW"
            } else {
                "BASE TABLE"
            };
            scoped(BoundStatement::with_params(
                OBJECT_COLUMNS,
                vec![schema.clone(), object, table_type.to_string()],
            ))
        }
        CatalogKind::TableIndexes => scoped(BoundStatement::with_params(
            TABLE_INDEXES,
            vec![schema.clone(), object],
        )),
        CatalogKind::TableRelationships => {
            let mut params = Vec::with_capacity(6);
            for _ in 0..3 {
                params.push(schema.clone());
                params.push(object.clone());
            }
            scoped(BoundStatement::with_params(TABLE_RELATIONSHIPS, params))
        }
        CatalogKind::Views => scoped(BoundStatement::with_params(
            LIST_VIEWS,
            vec![schema.clone(), like],
        )),
        CatalogKind::ViewDefinition => scoped(BoundStatement::with_params(
            VIEW_DEFINITION,
            vec![schema.clone(), object],
        )),
        CatalogKind::Procedures | CatalogKind::Functions => {
            let routine_type = routine_type(request.kind);
            scoped(BoundStatement::with_params(
                LIST_ROUTINES,
                vec![schema.clone(), routine_type.to_string(), like],
            ))
        }
        CatalogKind::ProcedureDefinition | CatalogKind::FunctionDefinition => {
            let routine_type = routine_type(request.kind);
            scoped(BoundStatement::with_params(
                ROUTINE_DEFINITION,
                vec![schema.clone(), routine_type.to_string(), object],
            ))
        }
        CatalogKind::ProcedureParameters => scoped(BoundStatement::with_params(
            PROCEDURE_PARAMETERS,
            vec![schema.clone(), object],
        )),
        CatalogKind::SampleData => {
            let rows = request
                .sample_rows
                .unwrap_or(DEFAULT_SAMPLE_ROWS)
                .clamp(1, max_rows.max(1));
            let order = if request.random { " ORDER BY RAND()" } else { "" };
            scoped(BoundStatement::text(format!(
                "SELECT * FROM {}{order} LIMIT {rows}",
                quoted_pair(&schema, &object)
            )))
        }
        CatalogKind::SearchObjects | CatalogKind::SearchDefinitions => {
            return Ok(search_query(request, database, like));
        }
    };
    Ok(query)
}

fn search_query(request: &CatalogRequest, database: String, pattern: String) -> CatalogQuery {
    // Searches span every visible database unless one was named explicitly.
    let scope = request.database.is_some().then(|| database.clone());
    let restrict = scope.clone().unwrap_or_default();
    let (template, default_types, slots): (&str, &[ObjectType], usize) = match request.kind {
        CatalogKind::SearchObjects => (
            SEARCH_OBJECTS,
            &[ObjectType::Table, ObjectType::View, ObjectType::Procedure, ObjectType::Function],
            4,
        ),
        _ => (
            SEARCH_DEFINITIONS,
            &[ObjectType::View, ObjectType::Procedure, ObjectType::Function],
            3,
        ),
    };

    let requested: Vec<ObjectType> = if request.object_types.is_empty() {
        default_types.to_vec()
    } else {
        request
            .object_types
            .iter()
            .copied()
            .filter(|t| default_types.contains(t))
            .collect()
    };
    // Unused type slots are bound to '', which matches no object type.
    let mut type_params: Vec<String> = requested.iter().map(|t| t.as_str().to_string()).collect();
    type_params.resize(slots, String::new());

    let mut params = vec![pattern.clone(), pattern];
    params.extend(type_params);
    params.push(restrict.clone());
    params.push(restrict);

    let sql = format!("{template}{SYSTEM_SCHEMA_LIST}\n ORDER BY o.database_name, o.object_name");
    CatalogQuery {
        database,
        scope,
        database_column: Some("database_name"),
        statement: BoundStatement::with_params(sql, params),
    }
}

/// Works out the schema and object a request targets. In MySQL a schema is a
/// database, so an unqualified name lives in the connection's database.
fn resolve_target(
    request: &CatalogRequest,
    database: &str,
) -> Result<(String, Option<String>), GuardError> {
    let explicit_schema = request
        .schema
        .as_deref()
        .map(validate_simple_identifier)
        .transpose()?;

    let (qualifier, object) = match request.name.as_deref() {
        Some(name) => {
            let qualified = validate_identifier(name)?;
            if qualified.parts().len() > 2 {
                return Err(GuardError::InvalidIdentifier(format!(
                    "'{name}': use schema.object or object"
                )));
            }
            (
                qualified.qualifier().map(str::to_string),
                Some(qualified.object().to_string()),
            )
        }
        None => (None, None),
    };

    let schema = match (explicit_schema, qualifier) {
        (Some(s), Some(q)) if !s.eq_ignore_ascii_case(&q) => {
            return Err(GuardError::InvalidIdentifier(format!(
                "schema '{s}' conflicts with qualified name '{q}'"
            )));
        }
        (Some(s), _) => s,
        (None, Some(q)) => q,
        (None, None) => database.to_string(),
    };
    Ok((schema, object))
}

fn routine_type(kind: CatalogKind) -> &'static str {
    match kind {
        CatalogKind::Functions | CatalogKind::FunctionDefinition => "FUNCTION",
        _ => "PROCEDURE",
    }
}

fn quoted_pair(schema: &str, object: &str) -> String {
    format!("{}.{}", quote_part(schema), quote_part(object))
}
