//! PostgreSQL SQL dialect.

use crate::core::identifier::{quote_literal, quote_pg};
use crate::core::{ColumnSpec, Dialect, SqlValue};
use crate::error::Result;

/// udt names decoded natively by the reader. Anything else is selected as
/// `::text`, including `numeric`, whose NaN and Infinity have no `Decimal`.
const NATIVE_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "float4", "float8", "text", "varchar", "bpchar", "name",
    "citext", "uuid", "timestamp", "timestamptz", "date", "time", "bytea",
];

/// udt names ordered with the binary collation.
const COLLATED_TYPES: &[&str] = &["text", "varchar", "bpchar", "name"];

/// udt names compared through a numeric literal.
const NUMERIC_TYPES: &[&str] = &["numeric", "money"];

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn is_native(data_type: &str) -> bool {
        NATIVE_TYPES.contains(&data_type.to_lowercase().as_str())
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_pg(name)
    }

    fn select_expr(&self, column: &ColumnSpec) -> Result<String> {
        let quoted = quote_pg(&column.name)?;
        Ok(match column.data_type.to_lowercase().as_str() {
            "money" => format!("{}::numeric::text", quoted),
            t if NATIVE_TYPES.contains(&t) => quoted,
            _ => format!("{}::text", quoted),
        })
    }

    fn order_expr(&self, column: &ColumnSpec) -> Result<String> {
        let quoted = quote_pg(&column.name)?;
        Ok(match column.data_type.to_lowercase().as_str() {
            t if COLLATED_TYPES.contains(&t) => format!("{} COLLATE \"C\"", quoted),
            // citext compares case-folded and takes no COLLATE of its own
            "citext" => format!("{}::text COLLATE \"C\"", quoted),
            "money" => format!("{}::numeric", quoted),
            _ => quoted,
        })
    }

    fn literal(&self, value: &SqlValue<'_>, column: &ColumnSpec) -> Result<String> {
        let numeric = NUMERIC_TYPES.contains(&column.data_type.to_lowercase().as_str());
        Ok(match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => format!("'{:?}'::float4", v),
            SqlValue::F64(v) => format!("'{:?}'::float8", v),
            SqlValue::Decimal(v) => format!("'{}'::numeric", v),
            SqlValue::Text(s) if numeric => format!("{}::numeric", quote_literal(s)?),
            SqlValue::Text(s) => quote_literal(s)?,
            SqlValue::Bytes(b) => format!("decode('{}', 'hex')", hex::encode(b)),
            SqlValue::Uuid(u) => format!("'{}'::uuid", u.hyphenated()),
            SqlValue::DateTime(v) => format!("'{}'::timestamp", v.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::DateTimeOffset(v) => {
                format!("'{}'::timestamptz", v.format("%Y-%m-%d %H:%M:%S%.f%:z"))
            }
            SqlValue::Date(v) => format!("'{}'::date", v.format("%Y-%m-%d")),
            SqlValue::Time(v) => format!("'{}'::time", v.format("%H:%M:%S%.f")),
        })
    }

    fn nulls_first(&self) -> &str {
        " NULLS FIRST"
    }

    fn limit_select(
        &self,
        columns: &str,
        from: &str,
        filter: Option<&str>,
        order_by: &str,
        limit: usize,
    ) -> String {
        let mut sql = format!("SELECT {} FROM {}", columns, from);
        if let Some(filter) = filter {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", order_by, limit));
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PageRequest, TableName, TableSpec, TypeClass};

    fn spec() -> TableSpec {
        TableSpec::new(
            TableName::new("public", "orders"),
            vec![
                ColumnSpec::new("region", "varchar", TypeClass::Text),
                ColumnSpec::new("id", "int4", TypeClass::Integer),
                ColumnSpec::new("payload", "jsonb", TypeClass::Unknown),
            ],
        )
    }

    fn ledger() -> TableSpec {
        TableSpec::new(
            TableName::new("public", "ledger"),
            vec![
                ColumnSpec::new("account", "citext", TypeClass::Text),
                ColumnSpec::new("amount", "numeric", TypeClass::Decimal),
                ColumnSpec::new("fee", "money", TypeClass::Decimal),
            ],
        )
    }

    #[test]
    fn test_first_page_query() {
        let spec = spec();
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: None,
                inclusive: false,
                limit: 500,
            })
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"region\", \"id\", \"payload\"::text FROM \"public\".\"orders\" \
             ORDER BY \"region\" COLLATE \"C\" NULLS FIRST, \"id\" NULLS FIRST LIMIT 500"
        );
    }

    #[test]
    fn test_keyset_predicate_is_lexicographic() {
        let spec = spec();
        let after = [SqlValue::text_owned("O'Hare".into()), SqlValue::I32(42)];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains(
            "WHERE \"region\" COLLATE \"C\" > 'O''Hare' \
             OR (\"region\" COLLATE \"C\" = 'O''Hare' AND \"id\" > 42)"
        ));
    }

    #[test]
    fn test_null_last_key_component() {
        let spec = spec();
        let after = [SqlValue::Null, SqlValue::I32(7)];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains(
            "WHERE \"region\" COLLATE \"C\" IS NOT NULL \
             OR (\"region\" COLLATE \"C\" IS NULL AND \"id\" > 7)"
        ));
    }

    #[test]
    fn test_inclusive_keyset_resumes_at_last_key() {
        let spec = spec();
        let after = [SqlValue::text_owned("EU".into()), SqlValue::I32(7)];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: Some(&after),
                inclusive: true,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains(
            "WHERE \"region\" COLLATE \"C\" > 'EU' \
             OR (\"region\" COLLATE \"C\" = 'EU' AND \"id\" >= 7) ORDER BY"
        ));

        let after = [SqlValue::text_owned("EU".into()), SqlValue::Null];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: Some(&after),
                inclusive: true,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains(
            "WHERE \"region\" COLLATE \"C\" > 'EU' OR \"region\" COLLATE \"C\" = 'EU' ORDER BY"
        ));
    }

    #[test]
    fn test_numeric_is_selected_as_text() {
        let spec = ledger();
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0],
                after: None,
                inclusive: false,
                limit: 100,
            })
            .unwrap();
        assert!(sql.starts_with(
            "SELECT \"account\", \"amount\"::text, \"fee\"::numeric::text FROM \"public\".\"ledger\""
        ));
    }

    #[test]
    fn test_numeric_key_text_literal_is_cast_back() {
        let spec = ledger();
        let after = [SqlValue::text_owned("Infinity".into())];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[1],
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains("WHERE \"amount\" > 'Infinity'::numeric ORDER BY \"amount\" NULLS FIRST"));
    }

    #[test]
    fn test_citext_key_uses_binary_collation() {
        let spec = ledger();
        let after = [SqlValue::text_owned("beta".into())];
        let sql = PostgresDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0],
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains(
            "WHERE \"account\"::text COLLATE \"C\" > 'beta' \
             ORDER BY \"account\"::text COLLATE \"C\" NULLS FIRST LIMIT 10"
        ));
    }

    #[test]
    fn test_money_orders_as_numeric() {
        let spec = ledger();
        let fee = &spec.columns[2];
        assert_eq!(PostgresDialect.order_expr(fee).unwrap(), "\"fee\"::numeric");
        assert_eq!(
            PostgresDialect
                .literal(&SqlValue::text_owned("12.50".into()), fee)
                .unwrap(),
            "'12.50'::numeric"
        );
    }
}
