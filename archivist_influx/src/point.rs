//! Canonical representation of a time-series point
//!
//! A [`Point`] is one timestamped row: a measurement name, a set of tags and
//! any number of float fields. Tags and fields are kept sorted so the encoded
//! line is stable, which InfluxDB also prefers for tag sets. Encoding to line
//! protocol goes through [`influxdb::WriteQuery`].

use std::collections::BTreeMap;

use influxdb::{Query, Timestamp, WriteQuery};

/// Errors produced when encoding a [`Point`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Line protocol cannot carry timestamps before the epoch.
    #[error("timestamp {0} is before the unix epoch")]
    Timestamp(i64),
    /// The point is not valid line protocol, most often for lack of fields.
    #[error("unable to encode point: {0}")]
    Encode(#[from] influxdb::Error),
}

/// A single field-based point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, f64>,
    /// Seconds since the unix epoch.
    timestamp: i64,
}

impl Point {
    /// Create a [`Point`] with no tags and no fields.
    #[must_use]
    pub fn new<M>(measurement: M, timestamp: i64) -> Self
    where
        M: Into<String>,
    {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Attach a tag, builder style.
    #[must_use]
    pub fn tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set a field, returning the value it replaced if the key was present.
    pub fn add_field<K>(&mut self, key: K, value: f64) -> Option<f64>
    where
        K: Into<String>,
    {
        self.fields.insert(key.into(), value)
    }

    /// Tags attached to this point.
    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Fields carried by this point.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, f64> {
        &self.fields
    }

    /// Timestamp in seconds since the unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Whether the point carries at least one field. A point without fields
    /// is not valid line protocol.
    #[must_use]
    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Encode this point as one line of line protocol, newline terminated.
    /// Timestamp precision is seconds.
    ///
    /// # Errors
    ///
    /// Function will error if the point has no fields or its timestamp is
    /// negative.
    pub fn to_line(&self) -> Result<String, Error> {
        let seconds =
            u128::try_from(self.timestamp).map_err(|_| Error::Timestamp(self.timestamp))?;
        let query = WriteQuery::new(Timestamp::Seconds(seconds), self.measurement.as_str());
        let query = self
            .tags
            .iter()
            .fold(query, |query, (key, value)| query.add_tag(key.as_str(), value.clone()));
        let query = self
            .fields
            .iter()
            .fold(query, |query, (key, value)| query.add_field(key.as_str(), *value));
        let mut line = query.build()?.get();
        line.push('\n');
        Ok(line)
    }
}
