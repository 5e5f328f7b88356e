//! Configuration validation.

use super::{Config, ConnectionConfig, DatabaseType};
use crate::error::{ReconcileError, Result};
use crate::typemap::TypeCompatibilityResolver;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_connection("source", &config.source)?;
    validate_connection("target", &config.target)?;

    // Comparing a table with itself is always a misconfiguration
    if config.source.r#type == config.target.r#type
        && config.source.host == config.target.host
        && config.source.get_port() == config.target.get_port()
        && config.source.database == config.target.database
        && config.tables.iter().all(|t| t.target.is_none())
        && config.schema_map.is_empty()
    {
        return Err(ReconcileError::Config(
            "source and target resolve to the same tables".into(),
        ));
    }

    for (i, table) in config.tables.iter().enumerate() {
        if table.source.trim().is_empty() {
            return Err(ReconcileError::Config(format!(
                "tables[{}].source is required",
                i
            )));
        }
        if !table.target_key_columns.is_empty()
            && table.target_key_columns.len() != table.key_columns.len()
        {
            return Err(ReconcileError::Config(format!(
                "tables[{}]: target_key_columns must pair one-to-one with key_columns",
                i
            )));
        }
        if let Some(col) = table
            .key_columns
            .iter()
            .find(|k| table.exclude_columns.iter().any(|e| e.eq_ignore_ascii_case(k)))
        {
            return Err(ReconcileError::Config(format!(
                "tables[{}]: key column '{}' cannot be excluded",
                i, col
            )));
        }
    }

    // Reconcile config validation - only check if explicitly set
    if let Some(0) = config.reconcile.batch_size {
        return Err(ReconcileError::Config(
            "reconcile.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.reconcile.buffer_batches {
        return Err(ReconcileError::Config(
            "reconcile.buffer_batches must be at least 1".into(),
        ));
    }
    if config.reconcile.numeric.scale > 28 {
        return Err(ReconcileError::Config(
            "reconcile.numeric.scale must be at most 28".into(),
        ));
    }
    TypeCompatibilityResolver::with_rules(&config.reconcile.type_rules)?;

    if config.output.detail_window == 0 {
        return Err(ReconcileError::Config(
            "output.detail_window must be at least 1".into(),
        ));
    }
    if config.output.mode.uses_file() && config.output.path.as_os_str().is_empty() {
        return Err(ReconcileError::Config("output.path is required".into()));
    }
    if config.output.mode.uses_table() && config.target.r#type != DatabaseType::Postgres {
        return Err(ReconcileError::Config(
            "output.mode 'table' requires a postgres target".into(),
        ));
    }

    Ok(())
}

fn validate_connection(side: &str, conn: &ConnectionConfig) -> Result<()> {
    if conn.host.is_empty() {
        return Err(ReconcileError::Config(format!("{}.host is required", side)));
    }
    if conn.database.is_empty() {
        return Err(ReconcileError::Config(format!(
            "{}.database is required",
            side
        )));
    }
    if conn.user.is_empty() {
        return Err(ReconcileError::Config(format!("{}.user is required", side)));
    }
    if conn.r#type == DatabaseType::Postgres {
        crate::drivers::tls::SslMode::parse(&conn.ssl_mode)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputConfig, OutputMode, ReconcileConfig, TableConfig};

    fn connection(r#type: DatabaseType, host: &str) -> ConnectionConfig {
        ConnectionConfig {
            r#type,
            host: host.to_string(),
            port: None,
            database: "sales".to_string(),
            user: "app".to_string(),
            password: "password".to_string(),
            schema: None,
            encrypt: false,
            trust_server_cert: true,
            ssl_mode: "disable".to_string(),
        }
    }

    fn valid_config() -> Config {
        Config {
            source: connection(DatabaseType::Mssql, "sqlhost"),
            target: connection(DatabaseType::Postgres, "pghost"),
            tables: vec![TableConfig {
                source: "Customers".to_string(),
                target: None,
                key_columns: vec!["Id".to_string()],
                target_key_columns: vec![],
                exclude_columns: vec![],
            }],
            schema_map: vec![],
            reconcile: ReconcileConfig::default(),
            output: OutputConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.target = config.source.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.reconcile.batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unpaired_target_keys_rejected() {
        let mut config = valid_config();
        config.tables[0].target_key_columns = vec!["id".into(), "region".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_excluded_key_rejected() {
        let mut config = valid_config();
        config.tables[0].exclude_columns = vec!["ID".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_table_output_requires_postgres_target() {
        let mut config = valid_config();
        config.output.mode = OutputMode::Table;
        assert!(validate(&config).is_ok());

        config.target = connection(DatabaseType::Mssql, "other");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode_rejected() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_connection_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
