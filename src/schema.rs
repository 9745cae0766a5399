//! Schema, column, and result-set types.
//!
//! Grounded on the teacher's `TableColumn` / `ForeignKey` / `Index` shapes
//! (referenced throughout `drivers/driver_trait.rs` and populated by
//! `drivers/mysql/mod.rs::get_columns` / `get_foreign_keys`), generalised to
//! the driver-neutral `Schema` spec.md §3 describes.

use serde::Serialize;

use crate::value::Value;

#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub name: String,
    /// Driver-native declared type name (e.g. "VARCHAR(255)", "INTEGER").
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub default_expr: Option<String>,
    pub foreign_key: Option<String>,
    pub max_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    pub primary: bool,
    pub index_type: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub local_columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: String,
    pub on_update: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub table_name: String,
    pub database_name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Cached row count; negative means unknown.
    pub row_count: i64,
}

impl Schema {
    /// Ordinal positions of the columns that together form the primary key,
    /// in declaration order. Used by the WHERE builder to compose
    /// `update`/`delete` predicates for composite keys.
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// One row of a result set. Invariant: `cells.len() == columns.len()` of the
/// owning `ResultSet` — enforced at construction, never partially built.
///
/// Not `Serialize`: `Value` has no JSON mapping of its own (BLOB needs its
/// hex encoding, FLOAT its shortest round-trip form), so every row is
/// written to the wire through `Value::to_json`, never through a derived
/// impl — see `dispatch.rs`'s `query`/`exec` handlers.
#[derive(Debug, Clone)]
pub struct Row {
    pub cells: Vec<Value>,
}

/// A column descriptor inside a `ResultSet`: name plus an inferred type tag
/// (distinct from `Column::data_type`, which is the driver-native name —
/// this is the `Value::kind()` the driver chose when materialising cells).
#[derive(Debug, Clone, Serialize)]
pub struct ResultColumn {
    pub name: String,
    pub type_tag: String,
}

#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
    pub total_rows: i64,
    pub approximate: bool,
}

impl ResultSet {
    pub fn empty(columns: Vec<ResultColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            total_rows: 0,
            approximate: false,
        }
    }

    pub fn push_row(&mut self, cells: Vec<Value>) -> Result<(), String> {
        if cells.len() != self.columns.len() {
            return Err(format!(
                "row has {} cells but result set has {} columns",
                cells.len(),
                self.columns.len()
            ));
        }
        self.rows.push(Row { cells });
        Ok(())
    }
}
