//! SQL Server SQL dialect.

use crate::core::identifier::{quote_literal, quote_mssql};
use crate::core::{ColumnSpec, Dialect, SqlValue};
use crate::error::Result;

/// Declared types decoded natively by the reader. Anything else is selected
/// as `NVARCHAR(MAX)`.
const NATIVE_TYPES: &[&str] = &[
    "bit",
    "tinyint",
    "smallint",
    "int",
    "bigint",
    "real",
    "float",
    "decimal",
    "numeric",
    "money",
    "smallmoney",
    "char",
    "varchar",
    "nchar",
    "nvarchar",
    "text",
    "ntext",
    "sysname",
    "uniqueidentifier",
    "date",
    "time",
    "datetime",
    "datetime2",
    "smalldatetime",
    "datetimeoffset",
    "binary",
    "varbinary",
    "image",
    "rowversion",
];

/// Types ordered with the binary collation so the server sorts by code
/// point.
const COLLATED_TYPES: &[&str] = &["char", "varchar", "nchar", "nvarchar", "sysname"];

/// Collation for text key ordering.
const BINARY_COLLATION: &str = "Latin1_General_BIN2";

/// SQL Server dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn is_native(data_type: &str) -> bool {
        NATIVE_TYPES.contains(&data_type.to_lowercase().as_str())
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "mssql"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_mssql(name)
    }

    fn select_expr(&self, column: &ColumnSpec) -> Result<String> {
        let quoted = quote_mssql(&column.name)?;
        Ok(match column.data_type.to_lowercase().as_str() {
            t if NATIVE_TYPES.contains(&t) => quoted,
            // CLR types have no cast to text
            "geography" | "geometry" | "hierarchyid" => {
                format!("{}.ToString() AS {}", quoted, quoted)
            }
            _ => format!("CAST({} AS NVARCHAR(MAX)) AS {}", quoted, quoted),
        })
    }

    fn order_expr(&self, column: &ColumnSpec) -> Result<String> {
        let quoted = quote_mssql(&column.name)?;
        let data_type = column.data_type.to_lowercase();
        Ok(if data_type == "uniqueidentifier" {
            // Native GUID order compares byte groups right to left
            format!("CONVERT(CHAR(36), {}) COLLATE {}", quoted, BINARY_COLLATION)
        } else if COLLATED_TYPES.contains(&data_type.as_str()) {
            format!("{} COLLATE {}", quoted, BINARY_COLLATION)
        } else {
            quoted
        })
    }

    fn literal(&self, value: &SqlValue<'_>, _column: &ColumnSpec) -> Result<String> {
        Ok(match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => format!("CAST('{:?}' AS REAL)", v),
            SqlValue::F64(v) => format!("CAST('{:?}' AS FLOAT)", v),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(s) => format!("N{}", quote_literal(s)?),
            SqlValue::Bytes(b) => format!("0x{}", hex::encode_upper(b)),
            // Matches CONVERT(CHAR(36), ...) in order_expr
            SqlValue::Uuid(u) => format!("'{}'", u.hyphenated().to_string().to_uppercase()),
            SqlValue::DateTime(v) => format!(
                "CAST('{}' AS DATETIME2(7))",
                v.format("%Y-%m-%dT%H:%M:%S%.f")
            ),
            SqlValue::DateTimeOffset(v) => format!(
                "CAST('{}' AS DATETIMEOFFSET(7))",
                v.format("%Y-%m-%dT%H:%M:%S%.f%:z")
            ),
            SqlValue::Date(v) => format!("CAST('{}' AS DATE)", v.format("%Y-%m-%d")),
            SqlValue::Time(v) => format!("CAST('{}' AS TIME(7))", v.format("%H:%M:%S%.f")),
        })
    }

    fn limit_select(
        &self,
        columns: &str,
        from: &str,
        filter: Option<&str>,
        order_by: &str,
        limit: usize,
    ) -> String {
        let mut sql = format!("SELECT TOP ({}) {} FROM {}", limit, columns, from);
        if let Some(filter) = filter {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql.push_str(&format!(" ORDER BY {}", order_by));
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PageRequest, TableName, TableSpec, TypeClass};
    use uuid::Uuid;

    fn spec() -> TableSpec {
        TableSpec::new(
            TableName::new("dbo", "Orders"),
            vec![
                ColumnSpec::new("OrderId", "uniqueidentifier", TypeClass::Text),
                ColumnSpec::new("Line", "int", TypeClass::Integer),
                ColumnSpec::new("Doc", "xml", TypeClass::Text),
            ],
        )
    }

    #[test]
    fn test_first_page_query() {
        let spec = spec();
        let sql = MssqlDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: None,
                inclusive: false,
                limit: 1000,
            })
            .unwrap();
        assert_eq!(
            sql,
            "SELECT TOP (1000) [OrderId], [Line], CAST([Doc] AS NVARCHAR(MAX)) AS [Doc] \
             FROM [dbo].[Orders] \
             ORDER BY CONVERT(CHAR(36), [OrderId]) COLLATE Latin1_General_BIN2, [Line]"
        );
    }

    #[test]
    fn test_keyset_literals() {
        let spec = spec();
        let id = Uuid::parse_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap();
        let after = [SqlValue::Uuid(id), SqlValue::I32(3)];
        let sql = MssqlDialect
            .build_page_query(&PageRequest {
                table: &spec,
                key_indices: &[0, 1],
                after: Some(&after),
                inclusive: false,
                limit: 10,
            })
            .unwrap();
        assert!(sql.contains("> 'A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11'"));
        assert!(sql.contains("AND [Line] > 3)"));
    }

    #[test]
    fn test_text_literal_is_escaped() {
        let col = ColumnSpec::new("Name", "nvarchar", TypeClass::Text);
        let lit = MssqlDialect
            .literal(&SqlValue::text_owned("it's".into()), &col)
            .unwrap();
        assert_eq!(lit, "N'it''s'");
        assert_eq!(
            MssqlDialect.order_expr(&col).unwrap(),
            "[Name] COLLATE Latin1_General_BIN2"
        );
    }
}
