//! Grouping and alias drivers

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use hwl_client::{CompositeClient, DriverClient};
use hwl_core::CallError;

use crate::driver::{Driver, DriverBase, EnumerateContext, Instance};

/// A node that only groups its children
#[derive(Debug)]
pub struct Composite {
    base: DriverBase,
}

impl Composite {
    pub const TYPE_NAME: &'static str = "hwl_exporter.drivers.composite.Composite";

    pub fn new(base: DriverBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Driver for Composite {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        CompositeClient::TYPE_NAME
    }
}

/// Alias of another node of the same tree
///
/// The target is looked up by its dotted path from the exported root when
/// the tree is enumerated. The alias reports the target's whole subtree in
/// its own place, under ids derived from the alias id so they stay unique;
/// calls on those ids reach the target's drivers.
#[derive(Debug)]
pub struct Proxy {
    base: DriverBase,
    reference: String,
}

impl Proxy {
    pub fn new(base: DriverBase, reference: impl Into<String>) -> Self {
        Self {
            base,
            reference: reference.into(),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn target(&self, root: &Arc<dyn Driver>, name: &str) -> Result<Arc<dyn Driver>, CallError> {
        let missing = || {
            CallError::config(format!(
                "Proxy driver {} references nonexistent driver {}",
                name, self.reference
            ))
        };

        let mut node = Arc::clone(root);
        for segment in self.reference.split('.') {
            if segment.is_empty() {
                return Err(missing());
            }
            let next = node.base().child_map().get(segment).cloned();
            node = next.ok_or_else(missing)?;
        }
        Ok(node)
    }
}

#[async_trait]
impl Driver for Proxy {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        DriverClient::TYPE_NAME
    }

    async fn enumerate(
        &self,
        _this: Arc<dyn Driver>,
        ctx: &EnumerateContext,
        parent: Option<String>,
        name: Option<String>,
    ) -> Result<Vec<Instance>, CallError> {
        let display_name = name.clone().unwrap_or_else(|| "<root>".to_string());
        if ctx.expanding(self.base.uuid()) {
            return Err(CallError::config(format!(
                "Proxy driver {} references itself through {}",
                display_name, self.reference
            )));
        }

        let target = self.target(ctx.root(), &display_name)?;
        let inner = ctx.enter_alias(self.base.uuid());
        let mut instances = target
            .enumerate(Arc::clone(&target), &inner, parent, name)
            .await?;

        let originals: std::collections::HashSet<String> =
            instances.iter().map(|i| i.report.uuid.clone()).collect();
        for instance in &mut instances {
            instance.report.uuid = alias_id(self.base.uuid(), &instance.report.uuid);
            if originals.contains(&instance.report.parent_uuid) {
                instance.report.parent_uuid =
                    alias_id(self.base.uuid(), &instance.report.parent_uuid);
            }
        }

        tracing::debug!(
            "Alias {} re-exports {} instances of {}",
            display_name,
            instances.len(),
            self.reference
        );
        Ok(instances)
    }
}

/// Stable id of `id` as seen through the alias `alias`
fn alias_id(alias: &str, id: &str) -> String {
    let namespace = Uuid::new_v5(&Uuid::NAMESPACE_OID, alias.as_bytes());
    Uuid::new_v5(&namespace, id.as_bytes()).to_string()
}
