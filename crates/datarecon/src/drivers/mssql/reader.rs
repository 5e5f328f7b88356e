//! SQL Server row source.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::MssqlDialect;
use crate::config::ConnectionConfig;
use crate::core::{
    ColumnSpec, Dialect, PageRequest, Row, RowSource, SqlValue, TableName, TableSpec, TypeClass,
};
use crate::error::{ReconcileError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// TCP keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type TdsClient = Client<Compat<TcpStream>>;

/// Reads key-ordered pages from one SQL Server connection.
pub struct MssqlReader {
    config: ConnectionConfig,
    client: Option<TdsClient>,
    dialect: MssqlDialect,
}

impl MssqlReader {
    /// Connect and verify the connection.
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let mut client = connect(config).await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        debug!("connected to SQL Server at {}", config.display_target());
        Ok(Self {
            config: config.clone(),
            client: Some(client),
            dialect: MssqlDialect::new(),
        })
    }

    fn client(&mut self) -> Result<&mut TdsClient> {
        let target = self.config.display_target();
        self.client
            .as_mut()
            .ok_or_else(|| ReconcileError::transient(target, "connection is closed"))
    }

    async fn load_columns(&mut self, table: &TableName) -> Result<Vec<ColumnSpec>> {
        let query = r#"
            SELECT
                c.name,
                TYPE_NAME(c.system_type_id),
                CAST(c.is_nullable AS INT)
            FROM sys.columns c
            JOIN sys.tables t ON t.object_id = c.object_id
            JOIN sys.schemas s ON s.schema_id = t.schema_id
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY c.column_id
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let rows = query.query(self.client()?).await?.into_first_result().await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: &str = row.try_get(0)?.unwrap_or_default();
            let data_type = match row.try_get::<&str, _>(1)?.unwrap_or_default() {
                // "timestamp" is the legacy name of rowversion, not a datetime
                "timestamp" => "rowversion",
                other => other,
            };
            let mut col = ColumnSpec::new(name, data_type, TypeClass::Unknown);
            col.is_nullable = row.try_get::<i32, _>(2)?.unwrap_or(1) == 1;
            columns.push(col);
        }
        Ok(columns)
    }

    async fn load_primary_key(&mut self, table: &TableName) -> Result<Vec<String>> {
        let query = r#"
            SELECT c.COLUMN_NAME
            FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
            JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE c
                ON c.CONSTRAINT_NAME = tc.CONSTRAINT_NAME
                AND c.TABLE_SCHEMA = tc.TABLE_SCHEMA
                AND c.TABLE_NAME = tc.TABLE_NAME
            WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
              AND tc.TABLE_SCHEMA = @P1
              AND tc.TABLE_NAME = @P2
            ORDER BY c.ORDINAL_POSITION
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let rows = query.query(self.client()?).await?.into_first_result().await?;
        let mut key = Vec::with_capacity(rows.len());
        for row in rows {
            let name: &str = row.try_get(0)?.unwrap_or_default();
            key.push(name.to_string());
        }
        Ok(key)
    }
}

#[async_trait]
impl RowSource for MssqlReader {
    fn db_type(&self) -> &str {
        "mssql"
    }

    async fn describe(&mut self, table: &TableName) -> Result<Option<TableSpec>> {
        let columns = self.load_columns(table).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        let primary_key = self.load_primary_key(table).await?;
        debug!(
            "{}: {} columns, primary key {:?}",
            table,
            columns.len(),
            primary_key
        );
        Ok(Some(
            TableSpec::new(table.clone(), columns).with_primary_key(primary_key),
        ))
    }

    async fn fetch_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>> {
        let sql = self.dialect.build_page_query(request)?;
        let rows = self
            .client()?
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;

        let columns = &request.table.columns;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, col) in columns.iter().enumerate() {
                values.push(convert_row_value(row, idx, &col.data_type)?);
            }
            out.push(Row::new(values));
        }
        Ok(out)
    }

    async fn row_count(&mut self, table: &TableName) -> Result<Option<i64>> {
        let query = r#"
            SELECT SUM(p.rows)
            FROM sys.partitions p
            JOIN sys.tables t ON p.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2 AND p.index_id IN (0, 1)
        "#;

        let mut query = Query::new(query);
        query.bind(table.schema.as_str());
        query.bind(table.name.as_str());

        let row = query.query(self.client()?).await?.into_row().await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>(0)?),
            None => Ok(None),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.client()?.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.client = None;
        let client = connect(&self.config).await?;
        self.client = Some(client);
        debug!("reconnected to SQL Server at {}", self.config.display_target());
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close().await {
                warn!("error closing SQL Server connection: {}", e);
            }
        }
    }
}

fn build_config(config: &ConnectionConfig) -> Config {
    let mut tds = Config::new();
    tds.host(&config.host);
    tds.port(config.get_port());
    tds.database(&config.database);
    tds.authentication(AuthMethod::sql_server(&config.user, &config.password));
    tds.application_name("datarecon");

    if config.encrypt {
        if config.trust_server_cert {
            tds.trust_cert();
        }
        tds.encryption(EncryptionLevel::Required);
    } else {
        tds.encryption(EncryptionLevel::NotSupported);
    }

    tds.packet_size(TDS_MAX_PACKET_SIZE);
    tds
}

/// Open one TDS connection with TCP keepalives.
async fn connect(config: &ConnectionConfig) -> Result<TdsClient> {
    let tds = build_config(config);
    let tcp = TcpStream::connect(tds.get_addr()).await?;
    tcp.set_nodelay(true).ok();

    let tcp = {
        let std_tcp = tcp.into_std()?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("failed to set TCP keepalive on SQL Server connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true)?;
        TcpStream::from_std(std_tcp)?
    };

    Ok(Client::connect(tds, tcp.compat_write()).await?)
}

/// Decode column `idx` by its declared type. Columns the dialect selected
/// as text come back as text.
fn convert_row_value(
    row: &tiberius::Row,
    idx: usize,
    data_type: &str,
) -> Result<SqlValue<'static>> {
    let value: SqlValue<'static> = match data_type.to_lowercase().as_str() {
        "bit" => row.try_get::<bool, _>(idx)?.into(),
        "tinyint" => row
            .try_get::<u8, _>(idx)?
            .map_or(SqlValue::Null, |v| SqlValue::I16(i16::from(v))),
        "smallint" => row.try_get::<i16, _>(idx)?.into(),
        "int" => row.try_get::<i32, _>(idx)?.into(),
        "bigint" => row.try_get::<i64, _>(idx)?.into(),
        "real" => row
            .try_get::<f32, _>(idx)?
            .map_or(SqlValue::Null, SqlValue::F32),
        "float" => row.try_get::<f64, _>(idx)?.into(),
        "decimal" | "numeric" => row
            .try_get::<Numeric, _>(idx)?
            .map_or(SqlValue::Null, numeric_value),
        // money arrives as a float
        "money" | "smallmoney" => match row.try_get::<Decimal, _>(idx) {
            Ok(v) => v.into(),
            Err(_) => row
                .try_get::<f64, _>(idx)?
                .map_or(SqlValue::Null, |f| {
                    Decimal::try_from(f).map_or(SqlValue::F64(f), SqlValue::Decimal)
                }),
        },
        "uniqueidentifier" => row.try_get::<Uuid, _>(idx)?.into(),
        "datetime" | "datetime2" | "smalldatetime" => {
            row.try_get::<NaiveDateTime, _>(idx)?.into()
        }
        "datetimeoffset" => row.try_get::<DateTime<FixedOffset>, _>(idx)?.into(),
        "date" => row.try_get::<NaiveDate, _>(idx)?.into(),
        "time" => row.try_get::<NaiveTime, _>(idx)?.into(),
        "binary" | "varbinary" | "image" | "rowversion" => row
            .try_get::<&[u8], _>(idx)?
            .map_or(SqlValue::Null, |b| SqlValue::Bytes(Cow::Owned(b.to_vec()))),
        _ => row
            .try_get::<&str, _>(idx)?
            .map_or(SqlValue::Null, |s| SqlValue::Text(Cow::Owned(s.to_string()))),
    };
    Ok(value)
}

/// `decimal(38, s)` can exceed the 96-bit mantissa and scale 28 of
/// `Decimal`. Those values are kept as their exact digits in text.
fn numeric_value(n: Numeric) -> SqlValue<'static> {
    match Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale())) {
        Ok(d) => SqlValue::Decimal(d),
        Err(_) => SqlValue::Text(Cow::Owned(render_numeric(n))),
    }
}

fn render_numeric(n: Numeric) -> String {
    let sign = if n.value() < 0 { "-" } else { "" };
    let digits = n.value().unsigned_abs().to_string();
    let scale = usize::from(n.scale());
    if scale == 0 {
        return format!("{}{}", sign, digits);
    }
    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    format!("{}{}.{}", sign, int_part, frac_part)
}
