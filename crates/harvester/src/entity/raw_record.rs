//! RawRecord - one harvested API record, stored as received.
//!
//! Raw tables are created per plugin and entity at runtime, so there is no
//! static `Entity` here. Queries are built against a [`RawTable`] name with
//! the [`RawColumn`] identifiers.

use std::fmt;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, DynIden, IntoIden};
use sea_orm::{DeriveIden, FromQueryResult};

use crate::collector::CollectorError;

/// Columns shared by every raw table.
#[derive(DeriveIden, Clone, Copy, Debug)]
pub enum RawColumn {
    Id,
    /// Fingerprint of the collection scope.
    Params,
    /// Record payload as received.
    Data,
    /// Serialized fan-out item; null for single-sequence collectors.
    Input,
    /// Creation time extracted from the payload (epoch milliseconds).
    RecordCreated,
    CreatedAt,
    UpdatedAt,
}

/// A row of a raw table.
#[derive(Clone, Debug, PartialEq, Eq, FromQueryResult)]
pub struct RawRecord {
    pub id: i64,
    pub params: String,
    pub data: Vec<u8>,
    pub input: Option<Vec<u8>>,
    pub record_created: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    #[must_use]
    pub fn record_created_at(&self) -> Option<DateTime<Utc>> {
        self.record_created.and_then(DateTime::from_timestamp_millis)
    }
}

/// Validated raw table name, `_raw_<plugin>_api_<entity>` by convention.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawTable(String);

impl RawTable {
    /// Conventional name for a plugin's raw table.
    pub fn new(plugin: &str, entity: &str) -> Result<Self, CollectorError> {
        Self::named(format!("_raw_{plugin}_api_{entity}"))
    }

    /// Use an explicit table name.
    ///
    /// Only ASCII letters, digits and underscores are accepted.
    pub fn named(name: impl Into<String>) -> Result<Self, CollectorError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if !valid {
            return Err(CollectorError::config(format!(
                "invalid raw table name {name:?}"
            )));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn iden(&self) -> DynIden {
        Alias::new(self.0.as_str()).into_iden()
    }
}

impl fmt::Display for RawTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
