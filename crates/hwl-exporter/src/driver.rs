//! Driver contract
//!
//! Every node of an exported tree implements [`Driver`]. A driver exposes
//! three kinds of operations to remote clients: unary calls, server-streaming
//! calls and raw byte streams. Methods a driver does not implement answer
//! with a method-not-found error.
//!
//! Before serving, the tree is flattened once by [`Driver::enumerate`] into
//! [`Instance`]s, one per reported node. Most drivers report themselves and
//! recurse into their children; aliases and external mounts override this
//! to splice other subtrees in.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use hwl_core::{ByteStream, CallError};
use hwl_protocol::{InstanceReport, CLIENT_LABEL, NAME_LABEL};

pub use hwl_client::ValueStream;

/// Identity, labels and children shared by every driver
#[derive(Clone)]
pub struct DriverBase {
    uuid: String,
    labels: BTreeMap<String, String>,
    children: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverBase {
    /// A base with a fresh random id
    pub fn new() -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().to_string())
    }

    /// A base with a fixed id
    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            labels: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_children(mut self, children: BTreeMap<String, Arc<dyn Driver>>) -> Self {
        self.children = children;
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn label_map(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn child_map(&self) -> &BTreeMap<String, Arc<dyn Driver>> {
        &self.children
    }
}

impl Default for DriverBase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverBase")
            .field("uuid", &self.uuid)
            .field("labels", &self.labels)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// State threaded through one enumeration of the exported tree
#[derive(Clone)]
pub struct EnumerateContext {
    root: Arc<dyn Driver>,
    aliases: Vec<String>,
}

impl EnumerateContext {
    /// Context for enumerating the tree rooted at `root`
    pub fn new(root: Arc<dyn Driver>) -> Self {
        Self {
            root,
            aliases: Vec::new(),
        }
    }

    /// Root of the tree being exported; dotted alias paths start here
    pub fn root(&self) -> &Arc<dyn Driver> {
        &self.root
    }

    /// Whether the alias with this id is already being expanded
    pub fn expanding(&self, alias: &str) -> bool {
        self.aliases.iter().any(|a| a == alias)
    }

    /// Context for expanding the alias with this id
    pub fn enter_alias(&self, alias: &str) -> Self {
        let mut next = self.clone();
        next.aliases.push(alias.to_string());
        next
    }
}

/// One reported node together with the driver serving it
#[derive(Clone)]
pub struct Instance {
    pub report: InstanceReport,
    pub driver: Arc<dyn Driver>,
}

impl Instance {
    /// Report `driver` under `parent` with the local `name`
    pub fn local(driver: Arc<dyn Driver>, parent: Option<String>, name: Option<String>) -> Self {
        let base = driver.base();
        let mut report = InstanceReport::new(base.uuid(), parent);
        report.labels = base.label_map().clone();
        report
            .labels
            .insert(CLIENT_LABEL.to_string(), driver.client().to_string());
        if let Some(name) = name {
            report.labels.insert(NAME_LABEL.to_string(), name);
        }
        Self { report, driver }
    }

    pub fn uuid(&self) -> &str {
        &self.report.uuid
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

/// A node of the exported tree
#[async_trait]
pub trait Driver: Send + Sync {
    fn base(&self) -> &DriverBase;

    /// Fully qualified client type name reported for this driver
    fn client(&self) -> &str;

    /// Unary call
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        Err(CallError::method_not_found(method))
    }

    /// Server-streaming call
    async fn streaming_call(
        &self,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        Err(CallError::method_not_found(method))
    }

    /// Open a raw byte stream
    ///
    /// The returned stream is relayed against the caller's stream until
    /// either side ends.
    async fn stream(
        &self,
        method: &str,
        _metadata: Vec<(String, String)>,
    ) -> Result<ByteStream, CallError> {
        Err(CallError::method_not_found(method))
    }

    /// Flatten this subtree into instances
    ///
    /// `this` must be the `Arc` holding `self`. The first returned instance
    /// is the subtree root, placed under `parent` as `name`.
    async fn enumerate(
        &self,
        this: Arc<dyn Driver>,
        ctx: &EnumerateContext,
        parent: Option<String>,
        name: Option<String>,
    ) -> Result<Vec<Instance>, CallError> {
        enumerate_local(this, ctx, parent, name).await
    }

    /// Release resources held by this driver and its children
    async fn close(&self) {
        for child in self.base().child_map().values() {
            child.close().await;
        }
    }

    /// Return this driver and its children to their initial state
    async fn reset(&self) {
        for child in self.base().child_map().values() {
            child.reset().await;
        }
    }
}

/// Report `this`, then every child subtree in name order
pub async fn enumerate_local(
    this: Arc<dyn Driver>,
    ctx: &EnumerateContext,
    parent: Option<String>,
    name: Option<String>,
) -> Result<Vec<Instance>, CallError> {
    let uuid = this.base().uuid().to_string();
    let children: Vec<(String, Arc<dyn Driver>)> = this
        .base()
        .child_map()
        .iter()
        .map(|(name, child)| (name.clone(), Arc::clone(child)))
        .collect();

    let mut instances = vec![Instance::local(this, parent, name)];
    for (child_name, child) in children {
        let subtree = child
            .enumerate(Arc::clone(&child), ctx, Some(uuid.clone()), Some(child_name))
            .await?;
        instances.extend(subtree);
    }
    Ok(instances)
}

/// Decode the argument at `index`
pub fn arg<T: serde::de::DeserializeOwned>(
    args: &[Value],
    index: usize,
    method: &str,
) -> Result<T, CallError> {
    let value = args.get(index).cloned().ok_or_else(|| {
        CallError::invalid_argument(format!("{}: missing argument {}", method, index))
    })?;
    serde_json::from_value(value).map_err(|e| {
        CallError::invalid_argument(format!("{}: bad argument {}: {}", method, index, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf {
        base: DriverBase,
    }

    #[async_trait]
    impl Driver for Leaf {
        fn base(&self) -> &DriverBase {
            &self.base
        }

        fn client(&self) -> &str {
            "test.Leaf"
        }
    }

    #[tokio::test]
    async fn test_enumerate_local_reports_children_under_parent() {
        let leaf: Arc<dyn Driver> = Arc::new(Leaf {
            base: DriverBase::with_uuid("leaf"),
        });
        let mut children = BTreeMap::new();
        children.insert("power".to_string(), leaf);
        let root: Arc<dyn Driver> = Arc::new(Leaf {
            base: DriverBase::with_uuid("root").with_children(children),
        });

        let ctx = EnumerateContext::new(Arc::clone(&root));
        let instances = root.enumerate(Arc::clone(&root), &ctx, None, None).await.unwrap();

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].uuid(), "root");
        assert!(instances[0].report.is_root());
        assert_eq!(instances[0].report.name(), None);
        assert_eq!(instances[1].report.parent(), Some("root"));
        assert_eq!(instances[1].report.name(), Some("power"));
        assert_eq!(instances[1].report.client(), Some("test.Leaf"));
    }

    #[tokio::test]
    async fn test_default_methods_not_found() {
        let leaf = Leaf {
            base: DriverBase::new(),
        };
        let err = leaf.call("frobnicate", vec![]).await.unwrap_err();
        assert_eq!(err.code, hwl_protocol::ErrorCode::MethodNotFound);
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn test_arg_decoding() {
        let args = vec![serde_json::json!(5), serde_json::json!("x")];
        assert_eq!(arg::<u32>(&args, 0, "m").unwrap(), 5);
        assert!(arg::<u32>(&args, 1, "m").is_err());
        assert!(arg::<u32>(&args, 2, "m").is_err());
    }
}
