//! Column encoding shared by the CRUD modules.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings with millisecond
//! precision and a `Z` suffix, so lexical order in SQL equals chronological
//! order.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn encode_opt_ts(ts: Option<&DateTime<Utc>>) -> Option<String> {
    ts.map(encode_ts)
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn ts_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn opt_ts_at(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_failure(idx, e))
    })
    .transpose()
}

/// Parse a text column through `FromStr` (uuids and the text enums).
pub(crate) fn parsed_at<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn opt_parsed_at<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub(crate) fn json_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(s) if s.is_empty() => Ok(serde_json::Value::Null),
        Some(s) => serde_json::from_str(&s).map_err(|e| conversion_failure(idx, e)),
    }
}

pub(crate) fn encode_json(value: &serde_json::Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoded_timestamps_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let a = encode_ts(&early);
        let b = encode_ts(&late);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }
}
