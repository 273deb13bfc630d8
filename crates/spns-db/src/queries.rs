//! Query functions organized by domain.

pub mod stats;
pub mod subscriptions;

use crate::DbError;

/// Convert a blob column into a fixed-width byte type.
pub(crate) fn fixed<T>(column: &str, blob: Vec<u8>) -> Result<T, DbError>
where
    T: for<'a> TryFrom<&'a [u8], Error = spns_types::TypesError>,
{
    T::try_from(blob.as_slice())
        .map_err(|e| DbError::CorruptRow(format!("column {column}: {e}")))
}

/// Convert an optional blob column into a fixed-width byte type.
pub(crate) fn fixed_opt<T>(column: &str, blob: Option<Vec<u8>>) -> Result<Option<T>, DbError>
where
    T: for<'a> TryFrom<&'a [u8], Error = spns_types::TypesError>,
{
    blob.map(|b| fixed(column, b)).transpose()
}
