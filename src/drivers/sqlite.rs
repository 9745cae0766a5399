//! SQLite backend, grounded on the teacher's `drivers/sqlite/extract.rs`
//! value-extraction order and `pool_manager.rs::get_sqlite_pool_with_id`
//! pool construction, flattened onto a single `sqlx::SqlitePool` per
//! connection instead of a keyed global pool map — spec.md's registry
//! already owns that keying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Row as SqlxRow, SqlitePool};

use crate::drivers::{ConnectionInfo, DatabaseDriver, ExecOutcome};
use crate::filter::{BuiltClause, DriverTag};
use crate::schema::{Column, ForeignKeyDef, IndexDef, ResultColumn, ResultSet, Schema};
use crate::value::Value;

pub struct SqliteDriver {
    pool: SqlitePool,
    cancelled: Arc<AtomicBool>,
}

impl SqliteDriver {
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, String> {
        let path = match info.path.as_deref() {
            None | Some("") => ":memory:".to_string(),
            Some(p) => p.to_string(),
        };
        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Self {
            pool,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn row_to_cells(row: &SqliteRow) -> Result<Vec<Value>, String> {
        let mut cells = Vec::with_capacity(row.columns().len());
        for i in 0..row.columns().len() {
            cells.push(extract_value(row, i)?);
        }
        Ok(cells)
    }
}

/// Mirrors the teacher's `drivers/sqlite/extract.rs` try-order: SQLite is
/// dynamically typed and stores dates/timestamps as text, so text is tried
/// before the numeric variants.
fn extract_value(row: &SqliteRow, idx: usize) -> Result<Value, String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(match v {
            Some(s) => Value::Text(s),
            None => Value::Null,
        });
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(Value::Int).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(Value::Float).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return Ok(v.map(Value::Bool).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Ok(v.map(Value::Blob).unwrap_or(Value::Null));
    }
    Ok(Value::Null)
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    v: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match v {
        Value::Null => q.bind(None::<String>),
        Value::Int(n) => q.bind(*n),
        Value::Float(f) => q.bind(*f),
        Value::Text(s) => q.bind(s.as_str()),
        Value::Blob(b) => q.bind(b.as_slice()),
        Value::Bool(b) => q.bind(*b),
        Value::Date(s) | Value::Timestamp(s) => q.bind(s.as_str()),
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn tag(&self) -> DriverTag {
        DriverTag::Sqlite
    }

    async fn list_tables(&self) -> Result<Vec<String>, String> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    async fn describe(&self, table: &str) -> Result<Schema, String> {
        let col_rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\"")))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        if col_rows.is_empty() {
            return Err(format!("no such table: {}", table));
        }

        let mut columns = Vec::with_capacity(col_rows.len());
        for r in &col_rows {
            let name: String = r.get("name");
            let data_type: String = r.get("type");
            let notnull: i64 = r.get("notnull");
            let pk: i64 = r.get("pk");
            let default_expr: Option<String> = r.get("dflt_value");
            columns.push(Column {
                name,
                data_type: data_type.clone(),
                nullable: notnull == 0,
                primary_key: pk > 0,
                auto_increment: pk > 0 && data_type.to_uppercase() == "INTEGER",
                default_expr,
                foreign_key: None,
                max_length: None,
            });
        }

        let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list(\"{}\")", table.replace('"', "\"\"")))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let mut foreign_keys = Vec::new();
        for r in &fk_rows {
            let referenced_table: String = r.get("table");
            let from: String = r.get("from");
            let to: String = r.get("to");
            let on_delete: String = r.get("on_delete");
            let on_update: String = r.get("on_update");
            foreign_keys.push(ForeignKeyDef {
                name: format!("fk_{}_{}", table, from),
                local_columns: vec![from],
                referenced_table,
                referenced_columns: vec![to],
                on_delete,
                on_update,
            });
        }

        let idx_rows = sqlx::query(&format!("PRAGMA index_list(\"{}\")", table.replace('"', "\"\"")))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let mut indexes = Vec::new();
        for r in &idx_rows {
            let name: String = r.get("name");
            let unique: i64 = r.get("unique");
            let origin: String = r.get("origin");
            let info_rows = sqlx::query(&format!("PRAGMA index_info(\"{}\")", name.replace('"', "\"\"")))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            let cols = info_rows.iter().map(|r| r.get::<String, _>("name")).collect();
            indexes.push(IndexDef {
                name,
                unique: unique != 0,
                primary: origin == "pk",
                index_type: "btree".to_string(),
                columns: cols,
            });
        }

        Ok(Schema {
            table_name: table.to_string(),
            database_name: "main".to_string(),
            columns,
            indexes,
            foreign_keys,
            row_count: -1,
        })
    }

    async fn count(&self, table: &str, where_clause: Option<&BuiltClause>) -> Result<(i64, bool), String> {
        let quoted = DriverTag::Sqlite.quote_identifier(table);
        let sql = match where_clause {
            Some(w) => format!("SELECT COUNT(*) FROM {} WHERE {}", quoted, w.sql),
            None => format!("SELECT COUNT(*) FROM {}", quoted),
        };
        let mut q = sqlx::query(&sql);
        if let Some(w) = where_clause {
            for b in &w.binds {
                q = bind_value(q, b);
            }
        }
        let row = q.fetch_one(&self.pool).await.map_err(|e| e.to_string())?;
        let n: i64 = row.get(0);
        Ok((n, false))
    }

    async fn query_page(
        &self,
        table: &str,
        offset: i64,
        limit: i64,
        where_clause: Option<&BuiltClause>,
        order_by: Option<&str>,
    ) -> Result<ResultSet, String> {
        let quoted = DriverTag::Sqlite.quote_identifier(table);
        let mut sql = format!("SELECT * FROM {}", quoted);
        if let Some(w) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&w.sql);
        }
        if let Some(o) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(o);
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

        let mut q = sqlx::query(&sql);
        if let Some(w) = where_clause {
            for b in &w.binds {
                q = bind_value(q, b);
            }
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| e.to_string())?;

        let columns = if let Some(first) = rows.first() {
            first
                .columns()
                .iter()
                .map(|c| ResultColumn { name: c.name().to_string(), type_tag: "text".to_string() })
                .collect()
        } else {
            Vec::new()
        };
        let mut result = ResultSet::empty(columns);
        for row in &rows {
            result.push_row(Self::row_to_cells(row)?)?;
        }
        Ok(result)
    }

    async fn exec(&self, sql: &str) -> Result<ExecOutcome, String> {
        if super::common::is_select_query(sql) {
            let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(|e| e.to_string())?;
            let columns = if let Some(first) = rows.first() {
                first
                    .columns()
                    .iter()
                    .map(|c| ResultColumn { name: c.name().to_string(), type_tag: "text".to_string() })
                    .collect()
            } else {
                Vec::new()
            };
            let mut result = ResultSet::empty(columns);
            for row in &rows {
                result.push_row(Self::row_to_cells(row)?)?;
            }
            Ok(ExecOutcome::Select(result))
        } else {
            let res = sqlx::query(sql).execute(&self.pool).await.map_err(|e| e.to_string())?;
            Ok(ExecOutcome::Dml { affected: res.rows_affected() })
        }
    }

    async fn update_cell(&self, table: &str, pk: &BuiltClause, column: &str, new_value: &Value) -> Result<(), String> {
        let quoted = DriverTag::Sqlite.quote_identifier(table);
        let quoted_col = DriverTag::Sqlite.quote_identifier(column);
        let sql = format!("UPDATE {} SET {} = ? WHERE {}", quoted, quoted_col, pk.sql);
        let mut q = sqlx::query(&sql);
        q = bind_value(q, new_value);
        for b in &pk.binds {
            q = bind_value(q, b);
        }
        let res = q.execute(&self.pool).await.map_err(|e| e.to_string())?;
        if res.rows_affected() == 0 {
            return Err("no such row".to_string());
        }
        Ok(())
    }

    async fn delete_row(&self, table: &str, pk: &BuiltClause) -> Result<(), String> {
        let quoted = DriverTag::Sqlite.quote_identifier(table);
        let sql = format!("DELETE FROM {} WHERE {}", quoted, pk.sql);
        let mut q = sqlx::query(&sql);
        for b in &pk.binds {
            q = bind_value(q, b);
        }
        let res = q.execute(&self.pool).await.map_err(|e| e.to_string())?;
        if res.rows_affected() == 0 {
            return Err("no such row".to_string());
        }
        Ok(())
    }

    async fn insert_row(&self, table: &str, columns: &[String], values: &[Value]) -> Result<Vec<(String, Value)>, String> {
        let quoted = DriverTag::Sqlite.quote_identifier(table);
        let col_list = columns
            .iter()
            .map(|c| DriverTag::Sqlite.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", quoted, col_list, placeholders);
        let mut q = sqlx::query(&sql);
        for v in values {
            q = bind_value(q, v);
        }
        let res = q.execute(&self.pool).await.map_err(|e| e.to_string())?;
        let schema = self.describe(table).await?;
        let pk_cols = schema.primary_key_columns();
        if pk_cols.len() == 1 && pk_cols[0].auto_increment {
            return Ok(vec![(pk_cols[0].name.clone(), Value::Int(res.last_insert_rowid()))]);
        }
        Ok(pk_cols
            .iter()
            .filter_map(|c| {
                let idx = columns.iter().position(|name| name == &c.name)?;
                Some((c.name.clone(), values[idx].clone()))
            })
            .collect())
    }

    async fn cancel_current(&self) {
        // sqlx's SQLite backend exposes no progress-interrupt hook; the
        // operation engine's cooperative cancellation flag is the only
        // mechanism that actually stops work in flight for this driver.
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
