//! Turning response bodies into raw records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::value::RawValue;

use crate::http::HttpResponse;

use super::CollectorError;

/// Splits a response body into opaque record blobs.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, response: &HttpResponse) -> Result<Vec<Vec<u8>>, CollectorError>;
}

impl<F> ResponseParser for F
where
    F: Fn(&HttpResponse) -> Result<Vec<Vec<u8>>, CollectorError> + Send + Sync,
{
    fn parse(&self, response: &HttpResponse) -> Result<Vec<Vec<u8>>, CollectorError> {
        self(response)
    }
}

/// Extracts each element of a JSON array, byte-for-byte as received.
///
/// The array is either the whole body or nested under object keys, e.g.
/// `JsonArrayParser::at(["data", "items"])`. A `null` array is empty.
#[derive(Debug, Clone, Default)]
pub struct JsonArrayParser {
    path: Vec<String>,
}

impl JsonArrayParser {
    /// The body itself is the array.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a dotted path such as `data.items`; empty means the root.
    #[must_use]
    pub fn dotted(path: &str) -> Self {
        Self::at(path.split('.').filter(|s| !s.is_empty()))
    }
}

impl ResponseParser for JsonArrayParser {
    fn parse(&self, response: &HttpResponse) -> Result<Vec<Vec<u8>>, CollectorError> {
        let mut current: Box<RawValue> = serde_json::from_slice(&response.body)?;
        for key in &self.path {
            let mut object: HashMap<String, Box<RawValue>> =
                serde_json::from_str(current.get()).map_err(|e| {
                    CollectorError::parse(format!("expected an object above {key:?}: {e}"))
                })?;
            current = object
                .remove(key)
                .ok_or_else(|| CollectorError::parse(format!("missing field {key:?}")))?;
        }
        let items: Option<Vec<Box<RawValue>>> = serde_json::from_str(current.get())?;
        Ok(items
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.get().as_bytes().to_vec())
            .collect())
    }
}

/// Reads the creation time of a record.
pub trait CreatedExtractor: Send + Sync {
    fn created(&self, record: &[u8]) -> Result<DateTime<Utc>, CollectorError>;
}

impl<F> CreatedExtractor for F
where
    F: Fn(&[u8]) -> Result<DateTime<Utc>, CollectorError> + Send + Sync,
{
    fn created(&self, record: &[u8]) -> Result<DateTime<Utc>, CollectorError> {
        self(record)
    }
}

/// RFC 3339 timestamp at a dotted JSON path, e.g. `created_at` or
/// `commit.author.date`.
#[derive(Debug, Clone)]
pub struct JsonTimestamp {
    pointer: String,
}

impl JsonTimestamp {
    #[must_use]
    pub fn field(path: &str) -> Self {
        let pointer = path
            .split('.')
            .fold(String::new(), |acc, part| format!("{acc}/{part}"));
        Self { pointer }
    }
}

impl CreatedExtractor for JsonTimestamp {
    fn created(&self, record: &[u8]) -> Result<DateTime<Utc>, CollectorError> {
        let value: serde_json::Value = serde_json::from_slice(record)
            .map_err(|e| CollectorError::created_time(e.to_string()))?;
        let raw = value
            .pointer(&self.pointer)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                CollectorError::created_time(format!("no timestamp string at {}", self.pointer))
            })?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CollectorError::created_time(format!("{raw:?}: {e}")))
    }
}
