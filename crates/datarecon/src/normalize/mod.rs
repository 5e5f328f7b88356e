//! Value and key normalization.
//!
//! - [`value`]: raw cell → [`ComparableValue`]
//! - [`key`]: key cells of a row → [`CanonicalKey`]

pub mod key;
pub mod value;

pub use key::{CanonicalKey, KeyColumn, KeyNormalizer, NullKeyComponent};
pub use value::{ComparableValue, ValueNormalizer};
