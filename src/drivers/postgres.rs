//! PostgreSQL backend, grounded on the teacher's `drivers/postgres/extract.rs`
//! try-order and on the teacher's own Cargo.toml carrying `tokio-postgres`
//! alongside `sqlx` — used here (instead of sqlx's Postgres support) because
//! `tokio_postgres::Client::cancel_token` gives a genuine mid-query cancel
//! path, which spec.md §5 "Cancellation" asks for on a best-effort basis.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_postgres::types::Type;
use tokio_postgres::NoTls;

use crate::drivers::{ConnectionInfo, DatabaseDriver, ExecOutcome};
use crate::filter::{BuiltClause, DriverTag};
use crate::schema::{Column, ForeignKeyDef, IndexDef, ResultColumn, ResultSet, Schema};
use crate::value::Value;

pub struct PostgresDriver {
    pool: Pool,
    database: String,
    cancel_token: Arc<Mutex<Option<tokio_postgres::CancelToken>>>,
}

impl PostgresDriver {
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, String> {
        let mut cfg = PoolConfig::new();
        cfg.host = info.host.clone();
        cfg.port = info.port;
        cfg.user = info.user.clone();
        cfg.password = info.password.clone();
        cfg.dbname = Some(info.database.clone());

        // TLS is negotiated by rustls/rustls-platform-verifier upstream of
        // this pool in deployments that require it; the bare NoTls connector
        // here matches what the teacher's own Postgres pool falls back to
        // for a plain `postgres://` URI with no `sslmode`.
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| e.to_string())?;

        // Prime the pool and stash a cancel token for the connection so
        // `cancel_current` has something to act on even before any
        // operation has run.
        let client = pool.get().await.map_err(|e| e.to_string())?;
        let token = client.cancel_token();

        Ok(Self {
            pool,
            database: info.database.clone(),
            cancel_token: Arc::new(Mutex::new(Some(token))),
        })
    }
}

/// Mirrors the teacher's `drivers/postgres/extract.rs` try-order: temporal
/// types first (Postgres reports them with real type information, unlike
/// SQLite), then integers, `NUMERIC` via `rust_decimal`, floats, booleans,
/// text, and finally raw bytes for `BYTEA`.
fn extract_value(row: &tokio_postgres::Row, idx: usize) -> Value {
    let col_type = row.columns()[idx].type_();

    if *col_type == Type::TIMESTAMPTZ || *col_type == Type::TIMESTAMP {
        if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDateTime>>(idx) {
            return v.map(|d| Value::Timestamp(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string())).unwrap_or(Value::Null);
        }
    }
    if *col_type == Type::DATE {
        if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
            return v.map(|d| Value::Date(d.to_string())).unwrap_or(Value::Null);
        }
    }
    if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
        return v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<i16>>(idx) {
        return v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<Decimal>>(idx) {
        return v.map(|d| Value::Float(d.to_string().parse().unwrap_or(0.0))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<_, Option<Vec<u8>>>(idx) {
        return v.map(Value::Blob).unwrap_or(Value::Null);
    }
    Value::Null
}

fn to_sql_param(v: &Value) -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
    match v {
        Value::Null => Box::new(Option::<String>::None),
        Value::Int(n) => Box::new(*n),
        Value::Float(f) => Box::new(*f),
        Value::Text(s) => Box::new(s.clone()),
        Value::Blob(b) => Box::new(b.clone()),
        Value::Bool(b) => Box::new(*b),
        Value::Date(s) | Value::Timestamp(s) => Box::new(s.clone()),
    }
}

fn rows_to_result(rows: &[tokio_postgres::Row]) -> Result<ResultSet, String> {
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
    for row in rows {
        let cells = (0..row.columns().len()).map(|i| extract_value(row, i)).collect();
        result.push_row(cells)?;
    }
    Ok(result)
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn tag(&self) -> DriverTag {
        DriverTag::Postgres
    }

    async fn list_tables(&self) -> Result<Vec<String>, String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        let rows = client
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public' ORDER BY table_name",
                &[],
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn describe(&self, table: &str) -> Result<Schema, String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;

        let col_rows = client
            .query(
                "SELECT column_name, data_type, is_nullable, column_default, character_maximum_length \
                 FROM information_schema.columns WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(|e| e.to_string())?;
        if col_rows.is_empty() {
            return Err(format!("relation \"{}\" does not exist", table));
        }

        let pk_rows = client
            .query(
                "SELECT a.attname FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = $1::regclass AND i.indisprimary",
                &[&table],
            )
            .await
            .map_err(|e| e.to_string())?;
        let pk_names: Vec<String> = pk_rows.iter().map(|r| r.get::<_, String>(0)).collect();

        let seq_rows = client
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = 'public' AND table_name = $1 AND column_default LIKE 'nextval(%'",
                &[&table],
            )
            .await
            .map_err(|e| e.to_string())?;
        let seq_names: Vec<String> = seq_rows.iter().map(|r| r.get::<_, String>(0)).collect();

        let columns = col_rows
            .iter()
            .map(|r| {
                let name: String = r.get("column_name");
                let data_type: String = r.get("data_type");
                let is_nullable: String = r.get("is_nullable");
                let default_expr: Option<String> = r.get("column_default");
                let max_length: Option<i32> = r.get("character_maximum_length");
                Column {
                    auto_increment: seq_names.contains(&name),
                    primary_key: pk_names.contains(&name),
                    nullable: is_nullable == "YES",
                    name,
                    data_type,
                    default_expr,
                    foreign_key: None,
                    max_length: max_length.map(|n| n as u64),
                }
            })
            .collect();

        let fk_rows = client
            .query(
                "SELECT tc.constraint_name, kcu.column_name, ccu.table_name AS referenced_table, ccu.column_name AS referenced_column \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu ON tc.constraint_name = kcu.constraint_name \
                 JOIN information_schema.constraint_column_usage ccu ON tc.constraint_name = ccu.constraint_name \
                 WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public' AND tc.table_name = $1",
                &[&table],
            )
            .await
            .map_err(|e| e.to_string())?;
        let foreign_keys = fk_rows
            .iter()
            .map(|r| ForeignKeyDef {
                name: r.get("constraint_name"),
                local_columns: vec![r.get("column_name")],
                referenced_table: r.get("referenced_table"),
                referenced_columns: vec![r.get("referenced_column")],
                on_delete: "NO ACTION".to_string(),
                on_update: "NO ACTION".to_string(),
            })
            .collect();

        let idx_rows = client
            .query(
                "SELECT ix.relname AS index_name, a.attname AS column_name, ix2.indisunique, ix2.indisprimary \
                 FROM pg_index ix2 \
                 JOIN pg_class ix ON ix.oid = ix2.indexrelid \
                 JOIN pg_class t ON t.oid = ix2.indrelid \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix2.indkey) \
                 WHERE t.relname = $1",
                &[&table],
            )
            .await
            .map_err(|e| e.to_string())?;
        let mut indexes: Vec<IndexDef> = Vec::new();
        for r in &idx_rows {
            let name: String = r.get("index_name");
            let column: String = r.get("column_name");
            let unique: bool = r.get("indisunique");
            let primary: bool = r.get("indisprimary");
            if let Some(existing) = indexes.iter_mut().find(|i| i.name == name) {
                existing.columns.push(column);
            } else {
                indexes.push(IndexDef { name, unique, primary, index_type: "btree".to_string(), columns: vec![column] });
            }
        }

        Ok(Schema {
            table_name: table.to_string(),
            database_name: self.database.clone(),
            columns,
            indexes,
            foreign_keys,
            row_count: -1,
        })
    }

    async fn count(&self, table: &str, where_clause: Option<&BuiltClause>) -> Result<(i64, bool), String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        let quoted = DriverTag::Postgres.quote_identifier(table);
        let sql = match where_clause {
            Some(w) => format!("SELECT COUNT(*) FROM {} WHERE {}", quoted, w.sql),
            None => format!("SELECT COUNT(*) FROM {}", quoted),
        };
        let boxed: Vec<_> = where_clause.map(|w| w.binds.iter().map(to_sql_param).collect()).unwrap_or_default();
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as _).collect();
        let row = client.query_one(&sql, &params).await.map_err(|e| e.to_string())?;
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
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        {
            let mut guard = self.cancel_token.lock().await;
            *guard = Some(client.cancel_token());
        }

        let quoted = DriverTag::Postgres.quote_identifier(table);
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

        let boxed: Vec<_> = where_clause.map(|w| w.binds.iter().map(to_sql_param).collect()).unwrap_or_default();
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as _).collect();
        let rows = client.query(&sql, &params).await.map_err(|e| e.to_string())?;
        rows_to_result(&rows)
    }

    async fn exec(&self, sql: &str) -> Result<ExecOutcome, String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        if super::common::is_select_query(sql) {
            let rows = client.query(sql, &[]).await.map_err(|e| e.to_string())?;
            Ok(ExecOutcome::Select(rows_to_result(&rows)?))
        } else {
            let affected = client.execute(sql, &[]).await.map_err(|e| e.to_string())?;
            Ok(ExecOutcome::Dml { affected })
        }
    }

    async fn update_cell(&self, table: &str, pk: &BuiltClause, column: &str, new_value: &Value) -> Result<(), String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        let quoted = DriverTag::Postgres.quote_identifier(table);
        let quoted_col = DriverTag::Postgres.quote_identifier(column);
        let sql = format!("UPDATE {} SET {} = $1 WHERE {}", quoted, quoted_col, pk.sql);
        let value_box = to_sql_param(new_value);
        let pk_boxes: Vec<_> = pk.binds.iter().map(to_sql_param).collect();
        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![value_box.as_ref()];
        params.extend(pk_boxes.iter().map(|b| b.as_ref() as _));
        let affected = client.execute(&sql, &params).await.map_err(|e| e.to_string())?;
        if affected == 0 {
            return Err("no such row".to_string());
        }
        Ok(())
    }

    async fn delete_row(&self, table: &str, pk: &BuiltClause) -> Result<(), String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        let quoted = DriverTag::Postgres.quote_identifier(table);
        let sql = format!("DELETE FROM {} WHERE {}", quoted, pk.sql);
        let boxed: Vec<_> = pk.binds.iter().map(to_sql_param).collect();
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as _).collect();
        let affected = client.execute(&sql, &params).await.map_err(|e| e.to_string())?;
        if affected == 0 {
            return Err("no such row".to_string());
        }
        Ok(())
    }

    async fn insert_row(&self, table: &str, columns: &[String], values: &[Value]) -> Result<Vec<(String, Value)>, String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        let quoted = DriverTag::Postgres.quote_identifier(table);
        let col_list = columns.iter().map(|c| DriverTag::Postgres.quote_identifier(c)).collect::<Vec<_>>().join(", ");
        let placeholders = (1..=columns.len()).map(|n| format!("${}", n)).collect::<Vec<_>>().join(", ");

        let schema = self.describe(table).await?;
        let pk_cols = schema.primary_key_columns();
        let returning = if pk_cols.is_empty() {
            String::new()
        } else {
            format!(" RETURNING {}", pk_cols.iter().map(|c| DriverTag::Postgres.quote_identifier(&c.name)).collect::<Vec<_>>().join(", "))
        };
        let sql = format!("INSERT INTO {} ({}) VALUES ({}){}", quoted, col_list, placeholders, returning);

        let boxed: Vec<_> = values.iter().map(to_sql_param).collect();
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as _).collect();

        if pk_cols.is_empty() {
            client.execute(&sql, &params).await.map_err(|e| e.to_string())?;
            return Ok(Vec::new());
        }
        let row = client.query_one(&sql, &params).await.map_err(|e| e.to_string())?;
        Ok(pk_cols
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), extract_value(&row, i)))
            .collect())
    }

    async fn cancel_current(&self) {
        if let Some(token) = self.cancel_token.lock().await.clone() {
            let _ = token.cancel_query(NoTls).await;
        }
    }
}
