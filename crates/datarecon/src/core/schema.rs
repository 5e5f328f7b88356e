//! Table and column metadata for one side of a reconciliation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Engine-agnostic category a declared column type maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeClass {
    Integer,
    Decimal,
    Text,
    Boolean,
    DateTime,
    Binary,
    Unknown,
}

impl TypeClass {
    /// All classes, in declaration order.
    pub const ALL: [TypeClass; 7] = [
        TypeClass::Integer,
        TypeClass::Decimal,
        TypeClass::Text,
        TypeClass::Boolean,
        TypeClass::DateTime,
        TypeClass::Binary,
        TypeClass::Unknown,
    ];

    /// Whether values of this class normalize to numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(self, TypeClass::Integer | TypeClass::Decimal)
    }
}

impl fmt::Display for TypeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeClass::Integer => "integer",
            TypeClass::Decimal => "decimal",
            TypeClass::Text => "text",
            TypeClass::Boolean => "boolean",
            TypeClass::DateTime => "datetime",
            TypeClass::Binary => "binary",
            TypeClass::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table` or a bare `table`, using `default_schema` for the latter.
    pub fn parse(qualified: &str, default_schema: &str) -> Result<Self> {
        let qualified = qualified.trim();
        let (schema, name) = match qualified.split_once('.') {
            Some((schema, name)) => (schema.trim(), name.trim()),
            None => (default_schema, qualified),
        };
        if name.is_empty() || schema.is_empty() {
            return Err(ReconcileError::Config(format!(
                "invalid table name '{}'",
                qualified
            )));
        }
        Ok(Self::new(schema, name))
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name as stored in the catalog.
    pub name: String,

    /// Engine-native declared type (e.g. `varchar`, `character varying`).
    pub data_type: String,

    /// Canonical class resolved from `data_type`.
    pub class: TypeClass,

    /// Whether the column is nullable.
    pub is_nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, class: TypeClass) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            class,
            is_nullable: true,
        }
    }

    /// Mark the column as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

/// Table metadata as reported by a row source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Resolved table name (catalog casing).
    pub name: TableName,

    /// Columns in ordinal order.
    pub columns: Vec<ColumnSpec>,

    /// Primary key column names, in key order. Empty if the table has none.
    pub primary_key: Vec<String>,
}

impl TableSpec {
    pub fn new(name: TableName, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name,
            columns,
            primary_key: Vec::new(),
        }
    }

    /// Set the primary key columns.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        self.name.full_name()
    }

    /// Position of a column, matched exactly first, then case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    /// Look up a column by name (see [`TableSpec::column_index`]).
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    /// Resolve key column names to positions, failing on the first missing one.
    pub fn key_indices(&self, key_columns: &[String]) -> Result<Vec<usize>> {
        if key_columns.is_empty() {
            return Err(ReconcileError::schema(
                self.full_name(),
                "no key columns given and the table has no primary key",
            ));
        }
        key_columns
            .iter()
            .map(|k| {
                self.column_index(k).ok_or_else(|| {
                    ReconcileError::schema(
                        self.full_name(),
                        format!("key column '{}' does not exist", k),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> TableSpec {
        TableSpec::new(
            TableName::new("dbo", "Customers"),
            vec![
                ColumnSpec::new("Id", "int", TypeClass::Integer).not_null(),
                ColumnSpec::new("Name", "nvarchar", TypeClass::Text),
                ColumnSpec::new("name", "varchar", TypeClass::Text),
            ],
        )
        .with_primary_key(["Id"])
    }

    #[test]
    fn test_parse_table_name() {
        let t = TableName::parse("sales.Orders", "dbo").unwrap();
        assert_eq!(t, TableName::new("sales", "Orders"));

        let t = TableName::parse("Orders", "dbo").unwrap();
        assert_eq!(t.full_name(), "dbo.Orders");

        assert!(TableName::parse("sales.", "dbo").is_err());
        assert!(TableName::parse("", "dbo").is_err());
    }

    #[test]
    fn test_column_index_prefers_exact_match() {
        let spec = customers();
        assert_eq!(spec.column_index("name"), Some(2));
        assert_eq!(spec.column_index("Name"), Some(1));
        assert_eq!(spec.column_index("ID"), Some(0));
        assert_eq!(spec.column_index("missing"), None);
    }

    #[test]
    fn test_key_indices() {
        let spec = customers();
        assert_eq!(spec.key_indices(&["id".to_string()]).unwrap(), vec![0]);

        let err = spec.key_indices(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch { .. }));

        assert!(spec.key_indices(&[]).is_err());
    }
}
