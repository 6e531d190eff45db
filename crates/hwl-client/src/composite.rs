//! Client for grouping drivers

use std::any::Any;
use std::sync::Arc;

use crate::client::{Client, ClientBase};
use crate::ClientError;

/// A node whose only purpose is to hold named children
pub struct CompositeClient {
    base: ClientBase,
}

impl CompositeClient {
    pub const TYPE_NAME: &'static str = "hwl_client.composite.CompositeClient";

    pub fn construct(base: ClientBase) -> Result<Arc<dyn Client>, ClientError> {
        Ok(Arc::new(Self { base }))
    }

    /// Child names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.base.children().keys().map(String::as_str)
    }

    /// Follow a dotted path of child names, e.g. `dut.power`
    pub fn lookup(&self, path: &str) -> Option<Arc<dyn Client>> {
        let mut segments = path.split('.');
        let mut node = self.base.child(segments.next()?)?.clone();
        for segment in segments {
            node = node.base().child(segment)?.clone();
        }
        Some(node)
    }
}

impl Client for CompositeClient {
    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
