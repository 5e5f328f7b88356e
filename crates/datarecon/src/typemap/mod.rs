//! Type compatibility between SQL Server and PostgreSQL columns.
//!
//! Declared type names are resolved to a [`TypeClass`] through an alias
//! table; two columns are comparable when their classes are equal or belong
//! to the same equivalence group. Both tables are plain data
//! ([`TypeEquivalenceRule`]) so new engines or aliases are added without
//! touching comparison code.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::TypeClass;
use crate::error::{ReconcileError, Result};

/// Built-in declared-type aliases for SQL Server and PostgreSQL.
const DEFAULT_ALIASES: &[(&str, TypeClass)] = &[
    // Integer
    ("tinyint", TypeClass::Integer),
    ("smallint", TypeClass::Integer),
    ("int", TypeClass::Integer),
    ("integer", TypeClass::Integer),
    ("bigint", TypeClass::Integer),
    ("int2", TypeClass::Integer),
    ("int4", TypeClass::Integer),
    ("int8", TypeClass::Integer),
    ("smallserial", TypeClass::Integer),
    ("serial", TypeClass::Integer),
    ("bigserial", TypeClass::Integer),
    ("serial2", TypeClass::Integer),
    ("serial4", TypeClass::Integer),
    ("serial8", TypeClass::Integer),
    // Decimal
    ("decimal", TypeClass::Decimal),
    ("numeric", TypeClass::Decimal),
    ("money", TypeClass::Decimal),
    ("smallmoney", TypeClass::Decimal),
    ("float", TypeClass::Decimal),
    ("real", TypeClass::Decimal),
    ("float4", TypeClass::Decimal),
    ("float8", TypeClass::Decimal),
    ("double precision", TypeClass::Decimal),
    // Text
    ("char", TypeClass::Text),
    ("nchar", TypeClass::Text),
    ("varchar", TypeClass::Text),
    ("nvarchar", TypeClass::Text),
    ("text", TypeClass::Text),
    ("ntext", TypeClass::Text),
    ("xml", TypeClass::Text),
    ("sysname", TypeClass::Text),
    ("character", TypeClass::Text),
    ("character varying", TypeClass::Text),
    ("bpchar", TypeClass::Text),
    ("name", TypeClass::Text),
    ("citext", TypeClass::Text),
    ("uniqueidentifier", TypeClass::Text),
    ("uuid", TypeClass::Text),
    // Boolean
    ("bit", TypeClass::Boolean),
    ("bool", TypeClass::Boolean),
    ("boolean", TypeClass::Boolean),
    // DateTime
    ("date", TypeClass::DateTime),
    ("time", TypeClass::DateTime),
    ("datetime", TypeClass::DateTime),
    ("datetime2", TypeClass::DateTime),
    ("smalldatetime", TypeClass::DateTime),
    ("datetimeoffset", TypeClass::DateTime),
    ("timestamp", TypeClass::DateTime),
    ("timestamptz", TypeClass::DateTime),
    ("timestamp without time zone", TypeClass::DateTime),
    ("timestamp with time zone", TypeClass::DateTime),
    ("time without time zone", TypeClass::DateTime),
    ("time with time zone", TypeClass::DateTime),
    ("timetz", TypeClass::DateTime),
    // Binary
    ("binary", TypeClass::Binary),
    ("varbinary", TypeClass::Binary),
    ("image", TypeClass::Binary),
    ("rowversion", TypeClass::Binary),
    ("bytea", TypeClass::Binary),
];

/// Built-in cross-class equivalences.
const DEFAULT_EQUIVALENCES: &[(TypeClass, TypeClass)] = &[(TypeClass::Integer, TypeClass::Decimal)];

/// One entry of the equivalence table.
///
/// In YAML:
///
/// ```yaml
/// type_rules:
///   - { alias: hierarchyid, class: text }
///   - { equivalent: [boolean, integer] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeEquivalenceRule {
    /// Declared type name (lowercase, without length/precision) → class.
    Alias { alias: String, class: TypeClass },

    /// Two classes whose values are mutually comparable.
    Equivalent { equivalent: [TypeClass; 2] },
}

/// Resolves declared types to classes and decides comparability.
#[derive(Debug, Clone)]
pub struct TypeCompatibilityResolver {
    aliases: HashMap<String, TypeClass>,
    /// Equivalence group representative per class, indexed by `class_index`.
    groups: [usize; 7],
}

impl Default for TypeCompatibilityResolver {
    fn default() -> Self {
        let mut resolver = Self {
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(name, class)| (name.to_string(), *class))
                .collect(),
            groups: [0, 1, 2, 3, 4, 5, 6],
        };
        for (a, b) in DEFAULT_EQUIVALENCES {
            resolver.join(*a, *b);
        }
        resolver
    }
}

impl TypeCompatibilityResolver {
    /// Resolver with the built-in tables only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with the built-in tables plus `rules`.
    pub fn with_rules<'a>(rules: impl IntoIterator<Item = &'a TypeEquivalenceRule>) -> Result<Self> {
        let mut resolver = Self::default();
        for rule in rules {
            resolver.add_rule(rule)?;
        }
        Ok(resolver)
    }

    /// Add one rule. Rules mentioning `Unknown` are rejected so unknown types
    /// can never be declared comparable.
    pub fn add_rule(&mut self, rule: &TypeEquivalenceRule) -> Result<()> {
        match rule {
            TypeEquivalenceRule::Alias { alias, class } => {
                if *class == TypeClass::Unknown {
                    return Err(ReconcileError::Config(format!(
                        "type rule for '{}' cannot target class unknown",
                        alias
                    )));
                }
                let key = canonical_type_name(alias);
                if key.is_empty() {
                    return Err(ReconcileError::Config("type rule alias cannot be empty".into()));
                }
                self.aliases.insert(key, *class);
            }
            TypeEquivalenceRule::Equivalent { equivalent: [a, b] } => {
                if *a == TypeClass::Unknown || *b == TypeClass::Unknown {
                    return Err(ReconcileError::Config(
                        "class unknown cannot be declared equivalent to another class".into(),
                    ));
                }
                self.join(*a, *b);
            }
        }
        Ok(())
    }

    /// Map an engine-native declared type to its canonical class.
    ///
    /// Length, precision and scale suffixes are ignored, so `varchar(10)`,
    /// `numeric(18, 2)` and `timestamp(3) without time zone` resolve like
    /// their bare names. Unrecognized names resolve to `Unknown`.
    pub fn resolve(&self, declared_type: &str) -> TypeClass {
        self.aliases
            .get(&canonical_type_name(declared_type))
            .copied()
            .unwrap_or(TypeClass::Unknown)
    }

    /// Whether values of the two classes may be compared.
    pub fn are_compatible(&self, a: TypeClass, b: TypeClass) -> bool {
        if a == b {
            return true;
        }
        if a == TypeClass::Unknown || b == TypeClass::Unknown {
            return false;
        }
        self.find(class_index(a)) == self.find(class_index(b))
    }

    /// Whether two declared types may be compared.
    pub fn are_types_compatible(&self, a: &str, b: &str) -> bool {
        self.are_compatible(self.resolve(a), self.resolve(b))
    }

    /// Class both sides of a compatible pair are normalized as, or `None` if
    /// the pair is incompatible.
    ///
    /// Equal classes normalize as themselves. Across classes the more
    /// structured one wins (numbers over booleans over text) so text values
    /// get parsed rather than numbers getting stringified.
    pub fn comparison_class(&self, a: TypeClass, b: TypeClass) -> Option<TypeClass> {
        if !self.are_compatible(a, b) {
            return None;
        }
        Some(if comparison_rank(a) >= comparison_rank(b) { a } else { b })
    }

    fn join(&mut self, a: TypeClass, b: TypeClass) {
        let ra = self.find(class_index(a));
        let rb = self.find(class_index(b));
        if ra != rb {
            self.groups[ra.max(rb)] = ra.min(rb);
        }
    }

    fn find(&self, mut idx: usize) -> usize {
        while self.groups[idx] != idx {
            idx = self.groups[idx];
        }
        idx
    }
}

fn class_index(class: TypeClass) -> usize {
    match class {
        TypeClass::Integer => 0,
        TypeClass::Decimal => 1,
        TypeClass::Text => 2,
        TypeClass::Boolean => 3,
        TypeClass::DateTime => 4,
        TypeClass::Binary => 5,
        TypeClass::Unknown => 6,
    }
}

fn comparison_rank(class: TypeClass) -> u8 {
    match class {
        TypeClass::Decimal => 6,
        TypeClass::Integer => 5,
        TypeClass::DateTime => 4,
        TypeClass::Boolean => 3,
        TypeClass::Binary => 2,
        TypeClass::Text => 1,
        TypeClass::Unknown => 0,
    }
}

/// Words that qualify a type without changing its class.
const TYPE_NOISE: &[&str] = &["array", "unsigned", "signed", "zerofill"];

/// Lowercase, drop parenthesized modifiers, array brackets and qualifier
/// words, and collapse whitespace.
fn canonical_type_name(declared: &str) -> String {
    let mut stripped = String::with_capacity(declared.len());
    let mut depth = 0usize;
    for ch in declared.chars() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.extend(ch.to_lowercase()),
            _ => {}
        }
    }
    stripped
        .split_whitespace()
        .filter(|word| !TYPE_NOISE.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for TypeEquivalenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeEquivalenceRule::Alias { alias, class } => write!(f, "{} -> {}", alias, class),
            TypeEquivalenceRule::Equivalent { equivalent: [a, b] } => write!(f, "{} ~ {}", a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strips_modifiers() {
        let r = TypeCompatibilityResolver::new();
        assert_eq!(r.resolve("varchar(10)"), TypeClass::Text);
        assert_eq!(r.resolve("Character Varying"), TypeClass::Text);
        assert_eq!(r.resolve("numeric(18, 2)"), TypeClass::Decimal);
        assert_eq!(r.resolve("timestamp(3) without time zone"), TypeClass::DateTime);
        assert_eq!(r.resolve("NVARCHAR(MAX)"), TypeClass::Text);
    }

    #[test]
    fn test_resolve_strips_array_and_sign_noise() {
        let r = TypeCompatibilityResolver::new();
        assert_eq!(r.resolve("int[]"), TypeClass::Integer);
        assert_eq!(r.resolve("integer ARRAY"), TypeClass::Integer);
        assert_eq!(r.resolve("varchar(20)[][]"), TypeClass::Text);
        assert_eq!(r.resolve("bigint unsigned"), TypeClass::Integer);
        assert_eq!(r.resolve("int(11) unsigned zerofill"), TypeClass::Integer);
        assert_eq!(canonical_type_name("Timestamp(3) With Time Zone[]"), "timestamp with time zone");
    }

    #[test]
    fn test_original_engine_pairs_are_compatible() {
        let r = TypeCompatibilityResolver::new();
        let pairs = [
            ("varchar", "character varying"),
            ("nvarchar", "character varying"),
            ("int", "integer"),
            ("int", "int4"),
            ("bigint", "int8"),
            ("smallint", "int2"),
            ("decimal", "numeric"),
            ("float", "double precision"),
            ("float", "float8"),
            ("bit", "boolean"),
            ("datetime", "timestamp"),
            ("date", "date"),
            ("text", "text"),
            ("char", "character"),
            ("uniqueidentifier", "uuid"),
        ];
        for (a, b) in pairs {
            assert!(r.are_types_compatible(a, b), "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_unknown_fails_closed() {
        let r = TypeCompatibilityResolver::new();
        assert_eq!(r.resolve("geography"), TypeClass::Unknown);
        assert!(r.are_compatible(TypeClass::Unknown, TypeClass::Unknown));
        for class in TypeClass::ALL {
            if class != TypeClass::Unknown {
                assert!(!r.are_compatible(TypeClass::Unknown, class));
                assert!(!r.are_compatible(class, TypeClass::Unknown));
            }
        }
    }

    #[test]
    fn test_compatibility_is_symmetric() {
        let r = TypeCompatibilityResolver::with_rules(&[TypeEquivalenceRule::Equivalent {
            equivalent: [TypeClass::Boolean, TypeClass::Integer],
        }])
        .unwrap();
        let names: Vec<&str> = DEFAULT_ALIASES.iter().map(|(n, _)| *n).collect();
        for a in &names {
            for b in &names {
                assert_eq!(r.are_types_compatible(a, b), r.are_types_compatible(b, a));
            }
        }
    }

    #[test]
    fn test_equivalence_is_transitive() {
        let r = TypeCompatibilityResolver::with_rules(&[TypeEquivalenceRule::Equivalent {
            equivalent: [TypeClass::Boolean, TypeClass::Integer],
        }])
        .unwrap();
        // Boolean ~ Integer and Integer ~ Decimal by default.
        assert!(r.are_compatible(TypeClass::Boolean, TypeClass::Decimal));
        assert!(!r.are_compatible(TypeClass::Boolean, TypeClass::Text));
    }

    #[test]
    fn test_default_cross_class_rules() {
        let r = TypeCompatibilityResolver::new();
        assert!(r.are_compatible(TypeClass::Integer, TypeClass::Decimal));
        assert!(!r.are_compatible(TypeClass::Text, TypeClass::Integer));
        assert!(!r.are_compatible(TypeClass::Boolean, TypeClass::Integer));
    }

    #[test]
    fn test_comparison_class() {
        let r = TypeCompatibilityResolver::with_rules(&[TypeEquivalenceRule::Equivalent {
            equivalent: [TypeClass::Boolean, TypeClass::Integer],
        }])
        .unwrap();
        assert_eq!(
            r.comparison_class(TypeClass::Integer, TypeClass::Decimal),
            Some(TypeClass::Decimal)
        );
        assert_eq!(
            r.comparison_class(TypeClass::Boolean, TypeClass::Integer),
            Some(TypeClass::Integer)
        );
        assert_eq!(r.comparison_class(TypeClass::Text, TypeClass::Text), Some(TypeClass::Text));
        assert_eq!(r.comparison_class(TypeClass::Text, TypeClass::Binary), None);
    }

    #[test]
    fn test_alias_rule() {
        let rule = TypeEquivalenceRule::Alias {
            alias: "HierarchyId".into(),
            class: TypeClass::Text,
        };
        let r = TypeCompatibilityResolver::with_rules(&[rule]).unwrap();
        assert_eq!(r.resolve("hierarchyid"), TypeClass::Text);
    }

    #[test]
    fn test_rules_naming_unknown_rejected() {
        let mut r = TypeCompatibilityResolver::new();
        assert!(r
            .add_rule(&TypeEquivalenceRule::Alias {
                alias: "x".into(),
                class: TypeClass::Unknown
            })
            .is_err());
        assert!(r
            .add_rule(&TypeEquivalenceRule::Equivalent {
                equivalent: [TypeClass::Unknown, TypeClass::Text]
            })
            .is_err());
    }

    #[test]
    fn test_rule_yaml_shapes() {
        let rules: Vec<TypeEquivalenceRule> =
            serde_yaml::from_str("- { alias: money, class: decimal }\n- { equivalent: [boolean, integer] }\n")
                .unwrap();
        assert_eq!(
            rules[0],
            TypeEquivalenceRule::Alias {
                alias: "money".into(),
                class: TypeClass::Decimal
            }
        );
        assert_eq!(
            rules[1],
            TypeEquivalenceRule::Equivalent {
                equivalent: [TypeClass::Boolean, TypeClass::Integer]
            }
        );
    }
}
