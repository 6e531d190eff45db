//! Driver instantiation from configuration
//!
//! Base nodes name their driver type; the registry maps those names to
//! constructor functions. Alias and external nodes are built in directly.
//! The exported root is an implicit [`Composite`] holding the top-level
//! `export` table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};

use hwl_client::ChannelOptions;
use hwl_core::config::DriverInstanceConfig;
use hwl_core::ConfigError;

use crate::driver::{Driver, DriverBase};
use crate::drivers::{Composite, External, MockPower, Proxy, TcpNetwork};
use crate::ExportError;

/// Constructor for one driver type
pub type DriverFactory = fn(DriverBase, &Map<String, Value>) -> Result<Arc<dyn Driver>, ConfigError>;

/// Registry of driver constructors keyed by fully qualified type name
#[derive(Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
    mount_options: ChannelOptions,
}

impl DriverRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            mount_options: ChannelOptions::default(),
        }
    }

    /// A registry holding the drivers shipped with this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Composite::TYPE_NAME, |base, _| {
            Ok(Arc::new(Composite::new(base)))
        });
        registry.register(MockPower::TYPE_NAME, |base, _| {
            Ok(Arc::new(MockPower::new(base)))
        });
        registry.register(TcpNetwork::TYPE_NAME, |base, config| {
            Ok(Arc::new(TcpNetwork::from_config(base, config)?))
        });
        registry
    }

    /// Connection settings used to mount external exporters
    pub fn with_mount_options(mut self, options: ChannelOptions) -> Self {
        self.mount_options = options;
        self
    }

    /// Register a constructor, replacing any previous one for the name
    pub fn register(&mut self, type_name: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Whether a constructor is registered under `type_name`
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Build the exported root from the top-level `export` table
    pub async fn instantiate_root(
        &self,
        export: &BTreeMap<String, DriverInstanceConfig>,
    ) -> Result<Arc<dyn Driver>, ExportError> {
        let children = self.instantiate_children(export).await?;
        tracing::info!("Instantiated {} top-level drivers", children.len());
        Ok(Arc::new(Composite::new(
            DriverBase::new().with_children(children),
        )))
    }

    /// Build one configured node and everything below it
    pub fn instantiate<'a>(
        &'a self,
        name: &'a str,
        config: &'a DriverInstanceConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn Driver>, ExportError>> {
        async move {
            let driver: Arc<dyn Driver> = match config {
                DriverInstanceConfig::Base(base) => {
                    let factory = self.factories.get(&base.type_name).ok_or_else(|| {
                        ExportError::UnknownDriver {
                            name: name.to_string(),
                            type_name: base.type_name.clone(),
                        }
                    })?;
                    let children = self.instantiate_children(&base.children).await?;
                    factory(DriverBase::new().with_children(children), &base.config).map_err(
                        |e| ExportError::InvalidDriverConfig {
                            name: name.to_string(),
                            reason: e.to_string(),
                        },
                    )?
                }
                DriverInstanceConfig::Composite(composite) => {
                    let children = self.instantiate_children(&composite.children).await?;
                    Arc::new(Composite::new(DriverBase::new().with_children(children)))
                }
                DriverInstanceConfig::Proxy(proxy) => {
                    if proxy.reference.is_empty() {
                        return Err(ExportError::InvalidDriverConfig {
                            name: name.to_string(),
                            reason: "empty ref".to_string(),
                        });
                    }
                    Arc::new(Proxy::new(DriverBase::new(), proxy.reference.clone()))
                }
                DriverInstanceConfig::External(external) => {
                    let mounted =
                        External::mount(DriverBase::new(), &external.target, self.mount_options.clone())
                            .await
                            .map_err(|source| ExportError::Mount {
                                name: name.to_string(),
                                target: external.target.clone(),
                                source,
                            })?;
                    Arc::new(mounted)
                }
            };
            tracing::debug!("Instantiated driver {} ({})", name, driver.base().uuid());
            Ok(driver)
        }
        .boxed()
    }

    async fn instantiate_children(
        &self,
        configs: &BTreeMap<String, DriverInstanceConfig>,
    ) -> Result<BTreeMap<String, Arc<dyn Driver>>, ExportError> {
        let mut children = BTreeMap::new();
        for (name, config) in configs {
            let child = self.instantiate(name, config).await?;
            children.insert(name.clone(), child);
        }
        Ok(children)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
