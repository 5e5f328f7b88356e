//! Database driver implementations.
//!
//! - [`mssql`]: Microsoft SQL Server (tiberius)
//! - [`postgres`]: PostgreSQL (tokio-postgres)
//! - [`memory`]: in-memory tables, for tests and embedding
//! - [`tls`]: PostgreSQL TLS setup
//!
//! Each SQL driver provides a `Dialect` that renders keyset page queries
//! and a reader that implements [`RowSource`] over one connection.

pub mod memory;
pub mod mssql;
pub mod postgres;
pub mod tls;

pub use memory::MemorySource;
pub use mssql::{MssqlDialect, MssqlReader};
pub use postgres::{PostgresDialect, PostgresReader};
pub use tls::SslMode;

use crate::config::{ConnectionConfig, DatabaseType};
use crate::core::RowSource;
use crate::error::Result;

/// Open a row source for a configured connection.
pub async fn open_source(config: &ConnectionConfig) -> Result<Box<dyn RowSource>> {
    let source: Box<dyn RowSource> = match config.r#type {
        DatabaseType::Mssql => Box::new(MssqlReader::new(config).await?),
        DatabaseType::Postgres => Box::new(PostgresReader::new(config).await?),
    };
    Ok(source)
}
