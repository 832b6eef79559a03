//! Built-in PostgreSQL tools.

use serde_json::{json, Map, Value};

use super::registry::{Handler, ParamDef, ParamType, ToolDefinition};
use crate::pool::DbSession;
use crate::types::{Error, Result};

/// Keywords refused by `pg_query` unless `unsafe` is set. Each must be
/// followed by whitespace to match.
const UNSAFE_KEYWORDS: &[&str] = &[
    "drop ", "truncate ", "delete ", "update ", "alter ", "create ", "insert ",
];

const SCHEMA_INFO_SQL: &str = "
SELECT
    t.table_name::text AS table_name,
    c.column_name::text AS column_name,
    c.data_type::text AS data_type,
    c.is_nullable::text AS is_nullable,
    c.column_default::text AS column_default,
    tc.constraint_type::text AS constraint_type
FROM information_schema.tables t
JOIN information_schema.columns c
    ON c.table_schema = t.table_schema AND c.table_name = t.table_name
LEFT JOIN information_schema.key_column_usage kcu
    ON kcu.table_schema = c.table_schema
    AND kcu.table_name = c.table_name
    AND kcu.column_name = c.column_name
LEFT JOIN information_schema.table_constraints tc
    ON tc.constraint_schema = kcu.constraint_schema
    AND tc.constraint_name = kcu.constraint_name
WHERE t.table_schema = 'public'";

const LIST_TABLES_SQL: &str = "
SELECT table_name::text AS table_name, table_type::text AS table_type
FROM information_schema.tables
WHERE table_schema::text = $1
ORDER BY table_name";

/// Definitions of every built-in tool.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new("pg_query", "Execute a PostgreSQL query", Handler::Query)
            .param(ParamDef::required(
                "query",
                ParamType::String,
                "The SQL query to execute",
            ))
            .param(
                ParamDef::optional(
                    "unsafe",
                    ParamType::Bool,
                    "Set to true to allow potentially unsafe queries (use with caution)",
                )
                .with_default(json!(false)),
            ),
        ToolDefinition::new(
            "pg_schema_info",
            "Get schema information about database tables",
            Handler::SchemaInfo,
        )
        .param(ParamDef::optional(
            "table",
            ParamType::String,
            "Specific table to get schema for (leave empty for all tables)",
        )),
        ToolDefinition::new(
            "pg_list_tables",
            "List tables and views in a schema",
            Handler::ListTables,
        )
        .param(
            ParamDef::optional("schema", ParamType::String, "Schema to list")
                .with_default(json!("public")),
        ),
    ]
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// First unsafe keyword in `query`, if any. Case and whitespace insensitive.
pub fn unsafe_keyword(query: &str) -> Option<&'static str> {
    let normalized: String = query
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c.to_ascii_lowercase() })
        .collect();
    UNSAFE_KEYWORDS
        .iter()
        .find(|keyword| normalized.contains(*keyword))
        .map(|keyword| keyword.trim_end())
}

pub async fn pg_query(session: &mut dyn DbSession, args: &Map<String, Value>) -> Result<Value> {
    let query = str_arg(args, "query")
        .ok_or_else(|| Error::invalid_argument("query", "Query parameter is required"))?;
    let allow_unsafe = args.get("unsafe").and_then(Value::as_bool).unwrap_or(false);

    if !allow_unsafe {
        if let Some(keyword) = unsafe_keyword(query) {
            return Err(Error::invalid_argument(
                "query",
                format!(
                    "Potentially unsafe query detected ({}). Set 'unsafe' to true to execute.",
                    keyword.to_uppercase()
                ),
            ));
        }
    }

    let output = session.query(query, &[]).await?;
    if output.rows.is_empty() {
        return Ok(json!({
            "message": "Query executed successfully with no rows returned",
            "columns": output.columns,
            "rows": [],
            "count": 0,
        }));
    }

    let count = output.row_count();
    Ok(json!({
        "columns": output.columns,
        "rows": output.rows,
        "count": count,
    }))
}

pub async fn pg_schema_info(
    session: &mut dyn DbSession,
    args: &Map<String, Value>,
) -> Result<Value> {
    let table = str_arg(args, "table").filter(|t| !t.is_empty());

    let mut sql = SCHEMA_INFO_SQL.to_string();
    let mut params = Vec::new();
    if let Some(table) = table {
        sql.push_str(" AND t.table_name::text = $1");
        params.push(table.to_string());
    }
    sql.push_str(" ORDER BY t.table_name, c.ordinal_position");

    let output = session.query(&sql, &params).await?;

    // Rows arrive ordered by table, so grouping preserves that order.
    let mut tables: Vec<(String, Vec<Value>)> = Vec::new();
    for row in &output.rows {
        let table_name = row
            .get("table_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut column = Map::new();
        column.insert(
            "column_name".to_string(),
            row.get("column_name").cloned().unwrap_or(Value::Null),
        );
        column.insert(
            "data_type".to_string(),
            row.get("data_type").cloned().unwrap_or(Value::Null),
        );
        column.insert(
            "is_nullable".to_string(),
            Value::Bool(row.get("is_nullable").and_then(Value::as_str) == Some("YES")),
        );
        if let Some(default) = row.get("column_default").filter(|v| !v.is_null()) {
            column.insert("default_value".to_string(), default.clone());
        }
        if let Some(constraint) = row.get("constraint_type").filter(|v| !v.is_null()) {
            column.insert("constraint".to_string(), constraint.clone());
        }

        match tables.last_mut() {
            Some((name, columns)) if *name == table_name => columns.push(Value::Object(column)),
            _ => tables.push((table_name, vec![Value::Object(column)])),
        }
    }

    if tables.is_empty() {
        let message = match table {
            Some(table) => format!("Table '{}' not found.", table),
            None => "No tables found in the database.".to_string(),
        };
        return Ok(json!({ "tables": [], "message": message }));
    }

    let tables: Vec<Value> = tables
        .into_iter()
        .map(|(table_name, columns)| json!({ "table_name": table_name, "columns": columns }))
        .collect();
    Ok(json!({ "tables": tables }))
}

pub async fn pg_list_tables(
    session: &mut dyn DbSession,
    args: &Map<String, Value>,
) -> Result<Value> {
    let schema = str_arg(args, "schema").unwrap_or("public").to_string();
    let output = session.query(LIST_TABLES_SQL, &[schema.clone()]).await?;
    let count = output.row_count();
    Ok(json!({
        "schema": schema,
        "tables": output.rows,
        "count": count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Connector, MemoryConnector, QueryOutput};
    use crate::types::ErrorKind;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_unsafe_keyword_detection() {
        assert_eq!(unsafe_keyword("SELECT * FROM users"), None);
        assert_eq!(unsafe_keyword("DROP TABLE users"), Some("drop"));
        assert_eq!(unsafe_keyword("delete\nfrom users"), Some("delete"));
        assert_eq!(unsafe_keyword("select updated_at from t"), None);
    }

    #[tokio::test]
    async fn test_pg_query_refuses_unsafe() {
        let connector = MemoryConnector::new();
        let mut session = connector.connect().await.unwrap();

        let err = pg_query(session.as_mut(), &args(json!({"query": "DELETE FROM t"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgumentError);
        assert_eq!(err.field(), Some("query"));
        assert!(connector.stats().queries.is_empty());
    }

    #[tokio::test]
    async fn test_pg_query_unsafe_override() {
        let connector = MemoryConnector::new();
        let mut session = connector.connect().await.unwrap();

        let out = pg_query(
            session.as_mut(),
            &args(json!({"query": "DELETE FROM t", "unsafe": true})),
        )
        .await
        .unwrap();
        assert_eq!(out["count"], 0);
        assert_eq!(connector.stats().queries, vec!["DELETE FROM t".to_string()]);
    }

    #[tokio::test]
    async fn test_pg_query_rows() {
        let connector = MemoryConnector::new();
        connector.on_query(|_, _| {
            let mut out = QueryOutput::new(vec!["id".to_string(), "name".to_string()]);
            out.rows.push(row(&[("id", json!(1)), ("name", json!("ada"))]));
            out.rows.push(row(&[("id", json!(2)), ("name", Value::Null)]));
            Ok(out)
        });
        let mut session = connector.connect().await.unwrap();

        let out = pg_query(session.as_mut(), &args(json!({"query": "SELECT id, name FROM u"})))
            .await
            .unwrap();
        assert_eq!(
            out,
            json!({
                "columns": ["id", "name"],
                "rows": [{"id": 1, "name": "ada"}, {"id": 2, "name": null}],
                "count": 2,
            })
        );
    }

    #[tokio::test]
    async fn test_pg_query_no_rows_message() {
        let connector = MemoryConnector::new();
        connector.on_query(|_, _| Ok(QueryOutput::new(vec!["id".to_string()])));
        let mut session = connector.connect().await.unwrap();

        let out = pg_query(session.as_mut(), &args(json!({"query": "SELECT id FROM u"})))
            .await
            .unwrap();
        assert_eq!(out["message"], "Query executed successfully with no rows returned");
        assert_eq!(out["columns"], json!(["id"]));
    }

    #[tokio::test]
    async fn test_schema_info_groups_by_table_and_binds_filter() {
        let connector = MemoryConnector::new();
        connector.on_query(|sql, params| {
            assert!(sql.contains("$1"));
            assert_eq!(params, ["users".to_string()]);
            let mut out = QueryOutput::default();
            out.rows.push(row(&[
                ("table_name", json!("users")),
                ("column_name", json!("id")),
                ("data_type", json!("integer")),
                ("is_nullable", json!("NO")),
                ("column_default", json!("nextval('users_id_seq'::regclass)")),
                ("constraint_type", json!("PRIMARY KEY")),
            ]));
            out.rows.push(row(&[
                ("table_name", json!("users")),
                ("column_name", json!("email")),
                ("data_type", json!("text")),
                ("is_nullable", json!("YES")),
                ("column_default", Value::Null),
                ("constraint_type", Value::Null),
            ]));
            Ok(out)
        });
        let mut session = connector.connect().await.unwrap();

        let out = pg_schema_info(session.as_mut(), &args(json!({"table": "users"})))
            .await
            .unwrap();
        assert_eq!(
            out,
            json!({
                "tables": [{
                    "table_name": "users",
                    "columns": [
                        {
                            "column_name": "id",
                            "data_type": "integer",
                            "is_nullable": false,
                            "default_value": "nextval('users_id_seq'::regclass)",
                            "constraint": "PRIMARY KEY",
                        },
                        {"column_name": "email", "data_type": "text", "is_nullable": true},
                    ],
                }],
            })
        );
    }

    #[tokio::test]
    async fn test_schema_info_not_found_message() {
        let connector = MemoryConnector::new();
        let mut session = connector.connect().await.unwrap();

        let out = pg_schema_info(session.as_mut(), &args(json!({"table": "ghost"})))
            .await
            .unwrap();
        assert_eq!(out["message"], "Table 'ghost' not found.");

        let out = pg_schema_info(session.as_mut(), &Map::new()).await.unwrap();
        assert_eq!(out["message"], "No tables found in the database.");
    }

    #[tokio::test]
    async fn test_list_tables_uses_schema_param() {
        let connector = MemoryConnector::new();
        connector.on_query(|_, params| {
            let mut out = QueryOutput::default();
            out.rows.push(row(&[
                ("table_name", json!(format!("{}_t", params[0]))),
                ("table_type", json!("BASE TABLE")),
            ]));
            Ok(out)
        });
        let mut session = connector.connect().await.unwrap();

        let out = pg_list_tables(session.as_mut(), &args(json!({"schema": "audit"})))
            .await
            .unwrap();
        assert_eq!(out["schema"], "audit");
        assert_eq!(out["count"], 1);
        assert_eq!(out["tables"][0]["table_name"], "audit_t");
    }
}
