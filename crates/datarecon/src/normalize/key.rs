//! Canonical composite keys.

use std::fmt;

use crate::core::{Row, TypeClass};

use super::value::{ComparableValue, ValueNormalizer};

/// Normalized key tuple used to align rows of both sides.
///
/// Ordering is lexicographic over the components in key declaration order,
/// which is the order the row sources sort by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalKey(pub Vec<ComparableValue>);

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

/// A key column of one side: its position in fetched rows and the class its
/// values are normalized as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    pub index: usize,
    pub class: TypeClass,
}

/// A key with a null component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullKeyComponent {
    pub column: String,
}

/// Builds [`CanonicalKey`]s from rows.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    normalizer: ValueNormalizer,
    nulls_allowed: bool,
}

impl KeyNormalizer {
    /// Key values are never case folded, rounded or truncated, whatever
    /// `normalizer` is set to.
    pub fn new(normalizer: &ValueNormalizer) -> Self {
        Self {
            normalizer: normalizer.for_keys(),
            nulls_allowed: false,
        }
    }

    /// Accept null components; they sort before every value.
    pub fn with_nulls_allowed(mut self, allowed: bool) -> Self {
        self.nulls_allowed = allowed;
        self
    }

    /// Normalize the key cells of `row` in `key_columns` order.
    pub fn build_key(
        &self,
        row: &Row,
        key_columns: &[KeyColumn],
    ) -> std::result::Result<CanonicalKey, NullKeyComponent> {
        let mut parts = Vec::with_capacity(key_columns.len());
        for key in key_columns {
            let value = self.normalizer.normalize(row.get(key.index), key.class);
            if value.is_absent() && !self.nulls_allowed {
                return Err(NullKeyComponent {
                    column: key.name.clone(),
                });
            }
            parts.push(value);
        }
        Ok(CanonicalKey(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlValue;
    use rust_decimal::Decimal;

    fn keys() -> Vec<KeyColumn> {
        vec![
            KeyColumn {
                name: "region".into(),
                index: 1,
                class: TypeClass::Text,
            },
            KeyColumn {
                name: "id".into(),
                index: 0,
                class: TypeClass::Integer,
            },
        ]
    }

    fn row(id: SqlValue<'static>, region: &str) -> Row {
        Row::new(vec![id, SqlValue::text_owned(region.to_string())])
    }

    #[test]
    fn test_build_key_follows_declared_order() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default());
        let key = kn.build_key(&row(SqlValue::I32(7), "EU  "), &keys()).unwrap();
        assert_eq!(
            key,
            CanonicalKey(vec![
                ComparableValue::Text("EU".into()),
                ComparableValue::Number(Decimal::from(7)),
            ])
        );
        assert_eq!(key.to_string(), "EU|7");
    }

    #[test]
    fn test_null_component_rejected() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default());
        let err = kn.build_key(&row(SqlValue::Null, "EU"), &keys()).unwrap_err();
        assert_eq!(err.column, "id");
    }

    #[test]
    fn test_null_component_allowed_sorts_first() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default()).with_nulls_allowed(true);
        let null = kn.build_key(&row(SqlValue::Null, "EU"), &keys()).unwrap();
        let zero = kn.build_key(&row(SqlValue::I32(0), "EU"), &keys()).unwrap();
        assert_eq!(null.to_string(), "EU|NULL");
        assert!(null < zero);
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default());
        let a = kn.build_key(&row(SqlValue::I32(9), "EU"), &keys()).unwrap();
        let b = kn.build_key(&row(SqlValue::I32(1), "US"), &keys()).unwrap();
        let c = kn.build_key(&row(SqlValue::I32(10), "EU"), &keys()).unwrap();
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);
    }

    #[test]
    fn test_keys_ignore_case_folding() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default().with_case_insensitive(true));
        let a = kn.build_key(&row(SqlValue::I32(1), "EU"), &keys()).unwrap();
        let b = kn.build_key(&row(SqlValue::I32(1), "eu"), &keys()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_equal_keys_across_engines() {
        let kn = KeyNormalizer::new(&ValueNormalizer::default());
        let source = kn
            .build_key(&row(SqlValue::I64(7), "EU"), &keys())
            .unwrap();
        let target = kn
            .build_key(&row(SqlValue::Decimal(Decimal::new(700, 2)), "EU"), &keys())
            .unwrap();
        assert_eq!(source, target);
    }
}
