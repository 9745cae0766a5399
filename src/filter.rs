//! Filter / sort / WHERE builder (spec.md §4.4).
//!
//! Composes parameterised SQL from structured predicates: the SQL text
//! never carries a user-supplied string for any operator other than `raw`.
//! Grounded on the teacher's per-driver identifier escaping
//! (`drivers/mysql/mod.rs::escape_identifier`) and placeholder conventions,
//! generalised across the three drivers via `DriverTag::placeholder`.

use crate::schema::Schema;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverTag {
    Sqlite,
    Postgres,
    Mysql,
    Mariadb,
}

impl DriverTag {
    pub fn identifier_quote(&self) -> char {
        match self {
            DriverTag::Postgres => '"',
            DriverTag::Sqlite | DriverTag::Mysql | DriverTag::Mariadb => '`',
        }
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        let q = self.identifier_quote();
        let escaped = name.replace(q, &format!("{0}{0}", q));
        format!("{q}{escaped}{q}")
    }

    /// Returns the placeholder token for bind parameter number `n` (1-based).
    fn placeholder(&self, n: usize) -> String {
        match self {
            DriverTag::Postgres => format!("${}", n),
            DriverTag::Sqlite | DriverTag::Mysql | DriverTag::Mariadb => "?".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Regex,
    Between,
    IsEmpty,
    IsNotEmpty,
    IsNull,
    IsNotNull,
    Raw,
}

#[derive(Debug, Clone)]
pub struct FilterPredicate {
    pub column_index: usize,
    pub operator: Operator,
    pub value: Option<String>,
    pub secondary_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct SortEntry {
    pub column_index: usize,
    pub direction: SortDirection,
}

/// A composed WHERE (or ORDER BY) fragment plus its sibling bind list. The
/// bind list must be supplied to the driver as parameters — never
/// interpolated into `sql`. Clonable so the same clause can be handed to
/// both a blocking load and a speculative background prefetch.
#[derive(Clone)]
pub struct BuiltClause {
    pub sql: String,
    pub binds: Vec<Value>,
}

/// Builds a `WHERE ...` clause (without the `WHERE` keyword) from an ordered
/// list of filter predicates, ANDed together. Returns `None` if `filters` is
/// empty (caller omits the clause entirely).
pub fn build_where(
    filters: &[FilterPredicate],
    schema: &Schema,
    driver: DriverTag,
) -> Result<Option<BuiltClause>, String> {
    if filters.is_empty() {
        return Ok(None);
    }

    let mut sql_parts = Vec::with_capacity(filters.len());
    let mut binds = Vec::new();
    let mut next_param = 1usize;

    for f in filters {
        let col = schema
            .columns
            .get(f.column_index)
            .ok_or_else(|| format!("filter references out-of-range column index {}", f.column_index))?;
        let quoted = driver.quote_identifier(&col.name);

        let fragment = match f.operator {
            Operator::Eq => cmp_fragment(&quoted, "=", f, driver, &mut next_param, &mut binds)?,
            Operator::Ne => cmp_fragment(&quoted, "<>", f, driver, &mut next_param, &mut binds)?,
            Operator::Lt => cmp_fragment(&quoted, "<", f, driver, &mut next_param, &mut binds)?,
            Operator::Le => cmp_fragment(&quoted, "<=", f, driver, &mut next_param, &mut binds)?,
            Operator::Gt => cmp_fragment(&quoted, ">", f, driver, &mut next_param, &mut binds)?,
            Operator::Ge => cmp_fragment(&quoted, ">=", f, driver, &mut next_param, &mut binds)?,
            Operator::In => {
                let raw = f
                    .value
                    .as_ref()
                    .ok_or("IN operator requires a comma-separated value list")?;
                let items: Vec<&str> = raw.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
                if items.is_empty() {
                    return Err("IN operator requires at least one value".to_string());
                }
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    placeholders.push(driver.placeholder(next_param));
                    next_param += 1;
                    binds.push(Value::Text(item.to_string()));
                }
                format!("{} IN ({})", quoted, placeholders.join(", "))
            }
            Operator::Contains => {
                let raw = f.value.as_ref().ok_or("LIKE-contains operator requires a value")?;
                binds.push(Value::Text(format!("%{}%", raw)));
                let ph = driver.placeholder(next_param);
                next_param += 1;
                format!("{} LIKE {}", quoted, ph)
            }
            Operator::Regex => {
                let raw = f.value.as_ref().ok_or("regex operator requires a value")?;
                let op = match driver {
                    DriverTag::Postgres => "~",
                    DriverTag::Mysql | DriverTag::Mariadb => "REGEXP",
                    DriverTag::Sqlite => {
                        return Err("SQLite does not support the regex filter operator".to_string())
                    }
                };
                binds.push(Value::Text(raw.clone()));
                let ph = driver.placeholder(next_param);
                next_param += 1;
                format!("{} {} {}", quoted, op, ph)
            }
            Operator::Between => {
                let lo = f.value.as_ref().ok_or("BETWEEN operator requires a lower bound")?;
                let hi = f
                    .secondary_value
                    .as_ref()
                    .ok_or("BETWEEN operator requires an upper bound")?;
                binds.push(Value::Text(lo.clone()));
                let ph1 = driver.placeholder(next_param);
                next_param += 1;
                binds.push(Value::Text(hi.clone()));
                let ph2 = driver.placeholder(next_param);
                next_param += 1;
                format!("{} BETWEEN {} AND {}", quoted, ph1, ph2)
            }
            Operator::IsEmpty => format!("{} = ''", quoted),
            Operator::IsNotEmpty => format!("{} <> ''", quoted),
            Operator::IsNull => format!("{} IS NULL", quoted),
            Operator::IsNotNull => format!("{} IS NOT NULL", quoted),
            Operator::Raw => {
                let raw = f.value.as_ref().ok_or("raw operator requires a literal SQL fragment")?;
                raw.clone()
            }
        };

        sql_parts.push(fragment);
    }

    Ok(Some(BuiltClause {
        sql: sql_parts.join(" AND "),
        binds,
    }))
}

fn cmp_fragment(
    quoted_col: &str,
    op: &str,
    f: &FilterPredicate,
    driver: DriverTag,
    next_param: &mut usize,
    binds: &mut Vec<Value>,
) -> Result<String, String> {
    let raw = f
        .value
        .as_ref()
        .ok_or_else(|| format!("operator {} requires a value", op))?;
    binds.push(Value::Text(raw.clone()));
    let ph = driver.placeholder(*next_param);
    *next_param += 1;
    Ok(format!("{} {} {}", quoted_col, op, ph))
}

/// Builds an `ORDER BY ...` clause (without the keyword). Empty list omits
/// the clause entirely (`None`).
pub fn build_order_by(sorts: &[SortEntry], schema: &Schema, driver: DriverTag) -> Result<Option<String>, String> {
    if sorts.is_empty() {
        return Ok(None);
    }
    let mut parts = Vec::with_capacity(sorts.len());
    for s in sorts {
        let col = schema
            .columns
            .get(s.column_index)
            .ok_or_else(|| format!("sort references out-of-range column index {}", s.column_index))?;
        let dir = match s.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        parts.push(format!("{} {}", driver.quote_identifier(&col.name), dir));
    }
    Ok(Some(parts.join(", ")))
}

/// Builds a primary-key equality clause (`<c1> = ? AND <c2> = ? ...`) for
/// `update_cell`/`delete_row`, starting bind numbering at `start_param`
/// (1-based) so it composes after an already-built WHERE/SET clause.
pub fn build_pk_clause(
    pk_columns: &[String],
    pk_values: &[Value],
    driver: DriverTag,
    start_param: usize,
) -> Result<BuiltClause, String> {
    if pk_columns.len() != pk_values.len() {
        return Err("primary key column/value count mismatch".to_string());
    }
    if pk_columns.is_empty() {
        return Err("table has no primary key columns to address a row by".to_string());
    }
    let mut parts = Vec::with_capacity(pk_columns.len());
    let mut binds = Vec::with_capacity(pk_columns.len());
    let mut n = start_param;
    for (col, val) in pk_columns.iter().zip(pk_values.iter()) {
        parts.push(format!("{} = {}", driver.quote_identifier(col), driver.placeholder(n)));
        n += 1;
        binds.push(val.clone());
    }
    Ok(BuiltClause {
        sql: parts.join(" AND "),
        binds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn test_schema() -> Schema {
        Schema {
            table_name: "users".into(),
            database_name: "main".into(),
            columns: vec![
                Column {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                    primary_key: true,
                    auto_increment: true,
                    default_expr: None,
                    foreign_key: None,
                    max_length: None,
                },
                Column {
                    name: "name".into(),
                    data_type: "TEXT".into(),
                    nullable: true,
                    primary_key: false,
                    auto_increment: false,
                    default_expr: None,
                    foreign_key: None,
                    max_length: None,
                },
            ],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: -1,
        }
    }

    #[test]
    fn eq_uses_placeholder_not_interpolation() {
        let schema = test_schema();
        let filters = vec![FilterPredicate {
            column_index: 1,
            operator: Operator::Eq,
            value: Some("Ada".to_string()),
            secondary_value: None,
        }];
        let built = build_where(&filters, &schema, DriverTag::Sqlite).unwrap().unwrap();
        assert_eq!(built.sql, "`name` = ?");
        assert_eq!(built.binds, vec![Value::Text("Ada".to_string())]);
    }

    #[test]
    fn postgres_uses_dollar_placeholders() {
        let schema = test_schema();
        let filters = vec![
            FilterPredicate {
                column_index: 1,
                operator: Operator::Eq,
                value: Some("Ada".to_string()),
                secondary_value: None,
            },
            FilterPredicate {
                column_index: 0,
                operator: Operator::Gt,
                value: Some("5".to_string()),
                secondary_value: None,
            },
        ];
        let built = build_where(&filters, &schema, DriverTag::Postgres).unwrap().unwrap();
        assert_eq!(built.sql, "\"name\" = $1 AND \"id\" > $2");
    }

    /// Fuzzes filter values containing SQL metacharacters and asserts they
    /// never appear in the generated SQL text (outside `raw`), only in the
    /// bind list (spec.md §8 "Filter safety").
    #[test]
    fn filter_values_never_interpolated_for_non_raw_operators() {
        let schema = test_schema();
        let nasty_values = [
            "'; DROP TABLE users; --",
            "1 OR 1=1",
            "`backtick`",
            "\"dquote\"",
            "%wild%",
        ];
        for nasty in nasty_values {
            for (op, needs_secondary) in [
                (Operator::Eq, false),
                (Operator::Ne, false),
                (Operator::Contains, false),
                (Operator::Between, true),
            ] {
                let filters = vec![FilterPredicate {
                    column_index: 1,
                    operator: op,
                    value: Some(nasty.to_string()),
                    secondary_value: if needs_secondary { Some("z".to_string()) } else { None },
                }];
                let built = build_where(&filters, &schema, DriverTag::Mysql).unwrap().unwrap();
                assert!(
                    !built.sql.contains(nasty),
                    "sql {:?} leaked raw value {:?}",
                    built.sql,
                    nasty
                );
                assert!(built.binds.iter().any(|b| matches!(b, Value::Text(s) if s.contains(nasty) || *s == format!("%{}%", nasty))));
            }
        }
    }

    #[test]
    fn raw_operator_is_concatenated_verbatim() {
        let schema = test_schema();
        let filters = vec![FilterPredicate {
            column_index: 0,
            operator: Operator::Raw,
            value: Some("id IN (SELECT id FROM archived)".to_string()),
            secondary_value: None,
        }];
        let built = build_where(&filters, &schema, DriverTag::Sqlite).unwrap().unwrap();
        assert_eq!(built.sql, "id IN (SELECT id FROM archived)");
        assert!(built.binds.is_empty());
    }

    #[test]
    fn is_null_and_is_empty_take_no_binds() {
        let schema = test_schema();
        for op in [Operator::IsNull, Operator::IsNotNull, Operator::IsEmpty, Operator::IsNotEmpty] {
            let filters = vec![FilterPredicate {
                column_index: 1,
                operator: op,
                value: None,
                secondary_value: None,
            }];
            let built = build_where(&filters, &schema, DriverTag::Sqlite).unwrap().unwrap();
            assert!(built.binds.is_empty());
        }
    }

    #[test]
    fn regex_unsupported_on_sqlite() {
        let schema = test_schema();
        let filters = vec![FilterPredicate {
            column_index: 1,
            operator: Operator::Regex,
            value: Some("^A".to_string()),
            secondary_value: None,
        }];
        assert!(build_where(&filters, &schema, DriverTag::Sqlite).is_err());
        assert!(build_where(&filters, &schema, DriverTag::Postgres).is_ok());
    }

    #[test]
    fn in_operator_splits_comma_list_into_one_bind_per_item() {
        let schema = test_schema();
        let filters = vec![FilterPredicate {
            column_index: 1,
            operator: Operator::In,
            value: Some("a, b,c".to_string()),
            secondary_value: None,
        }];
        let built = build_where(&filters, &schema, DriverTag::Sqlite).unwrap().unwrap();
        assert_eq!(built.sql, "`name` IN (?, ?, ?)");
        assert_eq!(built.binds.len(), 3);
    }

    #[test]
    fn order_by_empty_list_omits_clause() {
        let schema = test_schema();
        assert!(build_order_by(&[], &schema, DriverTag::Sqlite).unwrap().is_none());
    }

    #[test]
    fn order_by_joins_entries_in_order() {
        let schema = test_schema();
        let sorts = vec![
            SortEntry {
                column_index: 1,
                direction: SortDirection::Asc,
            },
            SortEntry {
                column_index: 0,
                direction: SortDirection::Desc,
            },
        ];
        let clause = build_order_by(&sorts, &schema, DriverTag::Sqlite).unwrap().unwrap();
        assert_eq!(clause, "`name` ASC, `id` DESC");
    }

    #[test]
    fn pk_clause_handles_composite_keys() {
        let built = build_pk_clause(
            &["a".to_string(), "b".to_string()],
            &[Value::Int(1), Value::Text("x".to_string())],
            DriverTag::Postgres,
            3,
        )
        .unwrap();
        assert_eq!(built.sql, "\"a\" = $3 AND \"b\" = $4");
        assert_eq!(built.binds, vec![Value::Int(1), Value::Text("x".to_string())]);
    }
}
