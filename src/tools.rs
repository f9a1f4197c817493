//! MCP tool table: definitions advertised by `tools/list` and the dispatch
//! from `tools/call` into the query service.

use log::debug;
use serde_json::{json, Map, Value};

use crate::catalog::{CatalogKind, CatalogRequest};
use crate::error::ToolError;
use crate::executor::{Connector, ResultSet};
use crate::rpc::{CatalogArguments, QueryArguments, Tool};
use crate::service::QueryService;

/// Argument layout of a tool, used for its input schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Query,
    Databases,
    Overview,
    Listing,
    Object(&'static str),
    Sample,
    Search,
}

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    kind: Option<CatalogKind>,
    shape: Shape,
}

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "execute_query",
        description: "Execute a single read-only SQL statement (SELECT, WITH, SHOW, DESCRIBE, EXPLAIN). Results are capped at the configured row limit.",
        kind: None,
        shape: Shape::Query,
    },
    ToolSpec {
        name: "get_sample_data",
        description: "Return the first rows of a table or view, optionally in random order",
        kind: Some(CatalogKind::SampleData),
        shape: Shape::Sample,
    },
    ToolSpec {
        name: "list_databases",
        description: "List databases with their character set, object count and size",
        kind: Some(CatalogKind::Databases),
        shape: Shape::Databases,
    },
    ToolSpec {
        name: "get_schema_overview",
        description: "Summarize a database: counts of tables, views, procedures and functions, and total size",
        kind: Some(CatalogKind::SchemaOverview),
        shape: Shape::Overview,
    },
    ToolSpec {
        name: "list_tables",
        description: "List base tables with engine, approximate row count and size",
        kind: Some(CatalogKind::Tables),
        shape: Shape::Listing,
    },
    ToolSpec {
        name: "get_table_definition",
        description: "Return the CREATE TABLE statement for a table",
        kind: Some(CatalogKind::TableDefinition),
        shape: Shape::Object("table_name"),
    },
    ToolSpec {
        name: "get_table_columns",
        description: "List the columns of a table with types, nullability, defaults and keys",
        kind: Some(CatalogKind::TableColumns),
        shape: Shape::Object("table_name"),
    },
    ToolSpec {
        name: "get_table_indexes",
        description: "List the indexes of a table with their columns",
        kind: Some(CatalogKind::TableIndexes),
        shape: Shape::Object("table_name"),
    },
    ToolSpec {
        name: "get_table_relationships",
        description: "List foreign keys leaving and referencing a table",
        kind: Some(CatalogKind::TableRelationships),
        shape: Shape::Object("table_name"),
    },
    ToolSpec {
        name: "list_views",
        description: "List views with their update and security options",
        kind: Some(CatalogKind::Views),
        shape: Shape::Listing,
    },
    ToolSpec {
        name: "get_view_definition",
        description: "Return the SELECT statement behind a view",
        kind: Some(CatalogKind::ViewDefinition),
        shape: Shape::Object("view_name"),
    },
    ToolSpec {
        name: "get_view_columns",
        description: "List the columns of a view",
        kind: Some(CatalogKind::ViewColumns),
        shape: Shape::Object("view_name"),
    },
    ToolSpec {
        name: "list_procedures",
        description: "List stored procedures",
        kind: Some(CatalogKind::Procedures),
        shape: Shape::Listing,
    },
    ToolSpec {
        name: "get_procedure_definition",
        description: "Return the body of a stored procedure",
        kind: Some(CatalogKind::ProcedureDefinition),
        shape: Shape::Object("procedure_name"),
    },
    ToolSpec {
        name: "get_procedure_parameters",
        description: "List the parameters of a stored procedure",
        kind: Some(CatalogKind::ProcedureParameters),
        shape: Shape::Object("procedure_name"),
    },
    ToolSpec {
        name: "list_functions",
        description: "List stored functions with their return types",
        kind: Some(CatalogKind::Functions),
        shape: Shape::Listing,
    },
    ToolSpec {
        name: "get_function_definition",
        description: "Return the body of a stored function",
        kind: Some(CatalogKind::FunctionDefinition),
        shape: Shape::Object("function_name"),
    },
    ToolSpec {
        name: "search_objects",
        description: "Find tables, views, procedures and functions whose name matches a LIKE pattern",
        kind: Some(CatalogKind::SearchObjects),
        shape: Shape::Search,
    },
    ToolSpec {
        name: "search_definitions",
        description: "Find views, procedures and functions whose body contains the given text",
        kind: Some(CatalogKind::SearchDefinitions),
        shape: Shape::Search,
    },
];

pub fn tool_definitions(max_rows: usize) -> Vec<Tool> {
    TOOLS
        .iter()
        .map(|spec| Tool {
            name: spec.name.to_string(),
            description: spec.description.to_string(),
            input_schema: input_schema(spec.shape, max_rows),
        })
        .collect()
}

fn input_schema(shape: Shape, max_rows: usize) -> Value {
    let database = json!({
        "type": "string",
        "description": "Database to use instead of the configured default"
    });
    let schema = json!({
        "type": "string",
        "description": "Schema (database) containing the object, if different from 'database'"
    });

    let mut properties = Map::new();
    let mut required: Vec<&str> = Vec::new();
    match shape {
        Shape::Query => {
            properties.insert(
                "query".into(),
                json!({"type": "string", "description": "A single read-only SQL statement"}),
            );
            properties.insert("database".into(), database);
            required.push("query");
        }
        Shape::Databases => {
            properties.insert(
                "pattern".into(),
                json!({"type": "string", "description": "LIKE pattern on the database name"}),
            );
            properties.insert(
                "include_system".into(),
                json!({"type": "boolean", "description": "Include system schemas", "default": false}),
            );
        }
        Shape::Overview => {
            properties.insert("database".into(), database);
        }
        Shape::Listing => {
            properties.insert("database".into(), database);
            properties.insert("schema".into(), schema);
            properties.insert(
                "pattern".into(),
                json!({"type": "string", "description": "LIKE pattern on the object name"}),
            );
        }
        Shape::Object(field) => {
            properties.insert(
                field.into(),
                json!({"type": "string", "description": "Object name, optionally qualified as schema.name"}),
            );
            properties.insert("database".into(), database);
            properties.insert("schema".into(), schema);
            required.push(field);
        }
        Shape::Sample => {
            properties.insert(
                "table_name".into(),
                json!({"type": "string", "description": "Table or view, optionally qualified as schema.name"}),
            );
            properties.insert("database".into(), database);
            properties.insert("schema".into(), schema);
            properties.insert(
                "rows".into(),
                json!({"type": "integer", "minimum": 1, "maximum": max_rows, "default": 10}),
            );
            properties.insert(
                "random".into(),
                json!({"type": "boolean", "description": "Sample in random order", "default": false}),
            );
            required.push("table_name");
        }
        Shape::Search => {
            properties.insert(
                "pattern".into(),
                json!({"type": "string", "description": "Text or LIKE pattern to search for"}),
            );
            properties.insert("database".into(), database);
            properties.insert(
                "object_types".into(),
                json!({
                    "type": "array",
                    "items": {"type": "string", "enum": ["table", "view", "procedure", "function"]}
                }),
            );
            required.push("pattern");
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// Runs one `tools/call` and returns the MCP result object.
pub async fn call_tool<C: Connector>(
    service: &QueryService<C>,
    name: &str,
    arguments: Value,
) -> Result<Value, ToolError> {
    let spec = TOOLS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
    debug!("Calling tool {name}");

    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    let Some(kind) = spec.kind else {
        let args: QueryArguments = parse_arguments(arguments)?;
        let result = service
            .validate_and_execute(&args.query, args.database.as_deref())
            .await?;
        let mut payload = result_payload(&result);
        payload.insert(
            "database".into(),
            json!(args.database.as_deref().unwrap_or(service.default_database())),
        );
        return Ok(text_content(&Value::Object(payload)));
    };

    let args: CatalogArguments = parse_arguments(arguments)?;
    if let Shape::Object(field) = spec.shape {
        if args.name.is_none() {
            return Err(ToolError::InvalidArguments(format!("'{field}' is required")));
        }
    }
    if spec.shape == Shape::Sample && args.name.is_none() {
        return Err(ToolError::InvalidArguments("'table_name' is required".to_string()));
    }
    if spec.shape == Shape::Search && args.pattern.as_deref().map_or(true, str::is_empty) {
        return Err(ToolError::InvalidArguments("'pattern' is required".to_string()));
    }

    let request = catalog_request(kind, args);
    let result = service.fetch_catalog_object(&request).await?;
    Ok(text_content(&format_catalog(&request, &result)))
}

fn parse_arguments<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn catalog_request(kind: CatalogKind, args: CatalogArguments) -> CatalogRequest {
    let mut request = CatalogRequest::new(kind)
        .database(args.database)
        .schema(args.schema)
        .pattern(args.pattern);
    if let Some(name) = args.name {
        request = request.name(name);
    }
    request.include_system = args.include_system;
    request.object_types = args.object_types;
    request.sample_rows = args.rows;
    request.random = args.random;
    request
}

fn result_payload(result: &ResultSet) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("columns".into(), json!(result.columns));
    payload.insert("rows".into(), Value::Array(result.rows_json()));
    payload.insert("row_count".into(), json!(result.row_count()));
    payload.insert("truncated".into(), json!(result.truncated));
    payload.insert("max_rows".into(), json!(result.max_rows));
    payload.insert("elapsed_ms".into(), json!(result.elapsed.as_millis() as u64));
    payload
}

fn format_catalog(request: &CatalogRequest, result: &ResultSet) -> Value {
    let object = request.name.as_deref().unwrap_or_default();
    match request.kind {
        CatalogKind::TableDefinition
        | CatalogKind::ViewDefinition
        | CatalogKind::ProcedureDefinition
        | CatalogKind::FunctionDefinition => {
            let label = match request.kind {
                CatalogKind::TableDefinition => "Table",
                CatalogKind::ViewDefinition => "View",
                CatalogKind::ProcedureDefinition => "Procedure",
                _ => "Function",
            };
            match definition_text(request.kind, result) {
                Some(Some(text)) => Value::String(text),
                Some(None) => Value::String(format!(
                    "{label} '{object}' exists but its definition is not visible to this account"
                )),
                None => Value::String(format!("{label} '{object}' not found")),
            }
        }
        CatalogKind::SchemaOverview => match result.rows_json().into_iter().next() {
            Some(summary) => summary,
            None => json!({}),
        },
        CatalogKind::TableRelationships => relationships_payload(result),
        _ => Value::Object(result_payload(result)),
    }
}

/// `None` when there is no row, `Some(None)` when the definition is NULL.
fn definition_text(kind: CatalogKind, result: &ResultSet) -> Option<Option<String>> {
    let row = result.rows.first()?;
    let value = if kind == CatalogKind::TableDefinition {
        // SHOW CREATE TABLE: (Table, Create Table) or (View, Create View, …)
        row.values.get(1)
    } else {
        row.get(&result.columns, "definition")
    };
    Some(value.and_then(|v| v.as_str()).map(str::to_string))
}

fn relationships_payload(result: &ResultSet) -> Value {
    let mut outgoing = Vec::new();
    let mut incoming = Vec::new();
    for (row, json) in result.rows.iter().zip(result.rows_json()) {
        match row.get(&result.columns, "direction").and_then(|v| v.as_str()) {
            Some("outgoing") => outgoing.push(json),
            _ => incoming.push(json),
        }
    }
    json!({
        "outgoing": outgoing,
        "incoming": incoming,
        "truncated": result.truncated,
        "max_rows": result.max_rows,
    })
}

fn text_content(value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| "Error formatting results".to_string()),
    };
    json!({
        "content": [{
            "type": "text",
            "text": text
        }]
    })
}
