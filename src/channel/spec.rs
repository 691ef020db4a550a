// src/channel/spec.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared data schema of a slot or channel. Two schemas are compatible
/// only when equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSchema(String);

impl DataSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DataSchema {
    fn default() -> Self {
        Self::new("bytes")
    }
}

impl fmt::Display for DataSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a channel carries data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSpec {
    /// Point-to-point streaming from the producer slot to its consumers.
    Direct { schema: DataSchema },
    /// Producer output is committed to durable storage at `uri`; consumers
    /// read it independently once it exists.
    Snapshot { schema: DataSchema, uri: String },
}

impl ChannelSpec {
    pub fn direct(schema: DataSchema) -> Self {
        ChannelSpec::Direct { schema }
    }

    pub fn snapshot(schema: DataSchema, uri: impl Into<String>) -> Self {
        ChannelSpec::Snapshot {
            schema,
            uri: uri.into(),
        }
    }

    pub fn schema(&self) -> &DataSchema {
        match self {
            ChannelSpec::Direct { schema } | ChannelSpec::Snapshot { schema, .. } => schema,
        }
    }

    pub fn snapshot_uri(&self) -> Option<&str> {
        match self {
            ChannelSpec::Snapshot { uri, .. } => Some(uri),
            ChannelSpec::Direct { .. } => None,
        }
    }
}

/// Role a slot plays when bound to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Producer,
    Consumer,
}
