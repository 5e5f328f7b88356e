//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL syntax strategy for PostgreSQL
//! - [`PostgresReader`]: row source over a single connection

mod dialect;
mod reader;

pub use dialect::PostgresDialect;
pub use reader::PostgresReader;

use std::time::Duration;

use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::warn;

use super::tls::{make_connector, SslMode};
use crate::config::ConnectionConfig;
use crate::error::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Open one connection, driving it on a background task.
pub(crate) async fn connect(config: &ConnectionConfig) -> Result<Client> {
    let mut pg_config = PgConfig::new();
    pg_config
        .host(&config.host)
        .port(config.get_port())
        .dbname(&config.database)
        .user(&config.user)
        .password(&config.password)
        .application_name("datarecon")
        .connect_timeout(CONNECT_TIMEOUT);

    let target = config.display_target();
    let client = match make_connector(SslMode::parse(&config.ssl_mode)?)? {
        Some(tls) => {
            let (client, connection) = pg_config.connect(tls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("PostgreSQL connection to {} ended: {}", target, e);
                }
            });
            client
        }
        None => {
            let (client, connection) = pg_config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("PostgreSQL connection to {} ended: {}", target, e);
                }
            });
            client
        }
    };
    Ok(client)
}
