//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::TableName;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the serialized configuration, recorded with each run.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Resolve the source and target table names for one table entry.
    ///
    /// Without an explicit target the source schema goes through
    /// `schema_map` (falling back to the target's default schema); names
    /// headed for PostgreSQL are lowercased, matching how unquoted
    /// identifiers are folded there.
    pub fn resolve_tables(&self, table: &TableConfig) -> Result<(TableName, TableName)> {
        let source = TableName::parse(&table.source, self.source.get_schema())?;
        let target = match &table.target {
            Some(target) => TableName::parse(target, self.target.get_schema())?,
            None => {
                let schema = self
                    .schema_map
                    .iter()
                    .find(|m| m.source.eq_ignore_ascii_case(&source.schema))
                    .map(|m| m.target.clone())
                    .unwrap_or_else(|| self.target.get_schema().to_string());
                let name = match self.target.r#type {
                    DatabaseType::Postgres => source.name.to_lowercase(),
                    DatabaseType::Mssql => source.name.clone(),
                };
                TableName::new(schema, name)
            }
        };
        Ok((source, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  type: mssql
  host: sqlhost
  database: Sales
  user: sa
  password: secret
target:
  type: postgres
  host: pghost
  database: sales
  user: postgres
  password: secret
tables:
  - source: Customers
    key_columns: [Id]
  - source: hr.Employees
  - source: dbo.Orders
    target: archive.orders_v2
schema_map:
  - { source: hr, target: people }
reconcile:
  batch_size: 500
  numeric: { scale: 2, rounding: truncate }
  datetime: { precision: seconds }
  type_rules:
    - { equivalent: [boolean, integer] }
output:
  mode: both
  path: /tmp/out
"#;

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.r#type, DatabaseType::Mssql);
        assert_eq!(config.source.get_port(), 1433);
        assert_eq!(config.target.get_port(), 5432);
        assert_eq!(config.target.ssl_mode, "require");
        assert_eq!(config.reconcile.get_batch_size(), 500);
        assert_eq!(config.reconcile.get_progress_interval(), 500);
        assert_eq!(config.reconcile.numeric.scale, 2);
        assert_eq!(config.reconcile.numeric.rounding, RoundingMode::Truncate);
        assert_eq!(config.reconcile.datetime.precision, DateTimePrecision::Seconds);
        assert_eq!(config.reconcile.datetime.mode, DateTimeMode::Truncate);
        assert_eq!(config.reconcile.type_rules.len(), 1);
        assert_eq!(config.output.mode, OutputMode::Both);
        assert_eq!(config.output.detail_window, 1_000);
        assert!(config.reconcile.row_count_check);
    }

    #[test]
    fn test_resolve_tables() {
        let config = Config::from_yaml(YAML).unwrap();

        let (s, t) = config.resolve_tables(&config.tables[0]).unwrap();
        assert_eq!(s.full_name(), "dbo.Customers");
        assert_eq!(t.full_name(), "public.customers");

        let (s, t) = config.resolve_tables(&config.tables[1]).unwrap();
        assert_eq!(s.full_name(), "hr.Employees");
        assert_eq!(t.full_name(), "people.employees");

        let (_, t) = config.resolve_tables(&config.tables[2]).unwrap();
        assert_eq!(t.full_name(), "archive.orders_v2");
    }

    #[test]
    fn test_hash_is_stable() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(YAML).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let config = Config::from_yaml(YAML).unwrap();
        let resources = SystemResources {
            total_memory_bytes: 64 * 1024 * 1024 * 1024,
            total_memory_gb: 64.0,
            cpu_cores: 16,
        };
        let tuned = config.reconcile.with_auto_tuning(&resources);
        assert_eq!(tuned.batch_size, Some(500));
        assert_eq!(tuned.buffer_batches, Some(4));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for(1).as_millis(), 200);
        assert_eq!(retry.delay_for(2).as_millis(), 400);
        assert_eq!(retry.delay_for(3).as_millis(), 800);
        assert_eq!(retry.delay_for(30).as_millis(), 5_000);
    }
}
