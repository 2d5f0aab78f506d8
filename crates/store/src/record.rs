use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version number of a stored record, used for optimistic concurrency control.
///
/// A record that does not exist is at version 0; the first write produces
/// version 1 and every subsequent write increments by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0), meaning "record must not exist yet".
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) for a freshly inserted record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A single stored value together with its concurrency metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Logical collection the record belongs to (e.g. `"sagas"`).
    pub namespace: String,

    /// Key within the namespace.
    pub key: String,

    /// Current version of the record.
    pub version: Version,

    /// The stored value as JSON.
    pub value: serde_json::Value,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Deserializes the stored value into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }
}
