//! The exported tree as served to clients
//!
//! The tree is enumerated exactly once. Every connection is answered from
//! the cached report list, and calls are dispatched by instance id through
//! a flat map.

use std::collections::HashMap;
use std::sync::Arc;

use hwl_core::CallError;
use hwl_protocol::{AlternativeEndpoint, InstanceReport};

use crate::driver::{Driver, EnumerateContext};
use crate::ExportError;

/// Enumerated tree, dispatch map and advertised endpoints
pub struct Session {
    root: Arc<dyn Driver>,
    drivers: HashMap<String, Arc<dyn Driver>>,
    reports: Vec<InstanceReport>,
    alternative_endpoints: Vec<AlternativeEndpoint>,
}

impl Session {
    /// Enumerate the tree rooted at `root`
    ///
    /// Fails if enumeration fails (dangling alias, unreachable external
    /// exporter) or if two instances share an id.
    pub async fn enumerate(root: Arc<dyn Driver>) -> Result<Self, ExportError> {
        let ctx = EnumerateContext::new(Arc::clone(&root));
        let instances = root
            .enumerate(Arc::clone(&root), &ctx, None, None)
            .await
            .map_err(ExportError::Enumerate)?;

        let mut drivers = HashMap::with_capacity(instances.len());
        let mut reports = Vec::with_capacity(instances.len());
        for instance in instances {
            if drivers
                .insert(instance.report.uuid.clone(), instance.driver)
                .is_some()
            {
                return Err(ExportError::DuplicateId(instance.report.uuid));
            }
            reports.push(instance.report);
        }

        tracing::info!("Exporting {} driver instances", reports.len());
        Ok(Self {
            root,
            drivers,
            reports,
            alternative_endpoints: Vec::new(),
        })
    }

    /// Advertise directly dialable endpoints in every report
    pub fn with_alternative_endpoints(mut self, endpoints: Vec<AlternativeEndpoint>) -> Self {
        self.alternative_endpoints = endpoints;
        self
    }

    pub fn reports(&self) -> &[InstanceReport] {
        &self.reports
    }

    pub fn alternative_endpoints(&self) -> &[AlternativeEndpoint] {
        &self.alternative_endpoints
    }

    pub fn root(&self) -> &Arc<dyn Driver> {
        &self.root
    }

    /// Driver serving the instance `uuid`
    pub fn driver(&self, uuid: &str) -> Result<Arc<dyn Driver>, CallError> {
        self.drivers
            .get(uuid)
            .cloned()
            .ok_or_else(|| CallError::not_found(uuid))
    }

    /// Close every driver of the tree
    pub async fn close(&self) {
        self.root.close().await;
    }

    /// Reset every driver of the tree
    pub async fn reset(&self) {
        self.root.reset().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.reports.len())
            .field("alternative_endpoints", &self.alternative_endpoints.len())
            .finish()
    }
}
