//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL syntax strategy for SQL Server
//! - [`MssqlReader`]: row source over a single TDS connection

mod dialect;
mod reader;

pub use dialect::MssqlDialect;
pub use reader::MssqlReader;
