//! Instance reports and alternative endpoint descriptors
//!
//! An exporter describes its driver tree as a flat list of [`InstanceReport`]
//! records. The list carries no ordering guarantee; parent links are resolved
//! by the receiver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the instance's local name within its parent
pub const NAME_LABEL: &str = "hwlink.dev/name";

/// Label carrying the fully qualified client type name
pub const CLIENT_LABEL: &str = "hwlink.dev/client";

/// Wire record describing one driver instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReport {
    /// Opaque unique identifier
    pub uuid: String,
    /// Identifier of the parent instance, empty for the root
    pub parent_uuid: String,
    /// Free-form labels, including the reserved name and client keys
    pub labels: BTreeMap<String, String>,
}

impl InstanceReport {
    /// Create a report with no labels
    pub fn new(uuid: impl Into<String>, parent_uuid: Option<String>) -> Self {
        Self {
            uuid: uuid.into(),
            parent_uuid: parent_uuid.unwrap_or_default(),
            labels: BTreeMap::new(),
        }
    }

    /// Builder-style label insertion
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Parent id, or `None` for the root
    pub fn parent(&self) -> Option<&str> {
        if self.parent_uuid.is_empty() {
            None
        } else {
            Some(&self.parent_uuid)
        }
    }

    /// Whether this report has no parent
    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_empty()
    }

    /// Local name within the parent
    pub fn name(&self) -> Option<&str> {
        self.labels.get(NAME_LABEL).map(String::as_str)
    }

    /// Fully qualified client type name
    pub fn client(&self) -> Option<&str> {
        self.labels.get(CLIENT_LABEL).map(String::as_str)
    }
}

/// A directly dialable TLS endpoint advertised by an exporter
///
/// The client private key is only ever held in memory by both sides.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternativeEndpoint {
    /// `host:port` the exporter listens on
    pub endpoint: String,
    /// PEM server certificate, the only trust root for this endpoint
    pub certificate: String,
    /// PEM client certificate to present
    pub client_certificate: String,
    /// PEM client private key
    pub client_private_key: String,
}

impl std::fmt::Debug for AlternativeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlternativeEndpoint")
            .field("endpoint", &self.endpoint)
            .field("client_private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
