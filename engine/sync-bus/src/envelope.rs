//! Origin-tagged message envelope

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a node taking part in replication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every replicated message travels inside an envelope naming its publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub origin: NodeId,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(origin: NodeId, payload: T) -> Self {
        Self { origin, payload }
    }

    /// True when the message was published by `node`
    pub fn is_from(&self, node: &NodeId) -> bool {
        self.origin == *node
    }
}
