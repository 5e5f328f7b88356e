//! Core types shared by the engine, the drivers and the sinks.
//!
//! - [`schema`]: table and column metadata, canonical type classes
//! - [`value`]: raw cell values and rows as delivered by a row source
//! - [`identifier`]: identifier quoting and literal escaping for generated SQL
//! - [`traits`]: row source and SQL dialect abstractions

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{ColumnSpec, TableName, TableSpec, TypeClass};
pub use traits::{Dialect, PageRequest, RowSource};
pub use value::{Row, SqlValue};
