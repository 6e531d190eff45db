//! Building a client tree from an exporter connection, or from an exporter
//! configuration alone

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use hwl_core::config::{ClientConfig, DriverInstanceConfig, ExporterConfig};
use hwl_core::tree;
use hwl_protocol::{AlternativeEndpoint, InstanceReport, CLIENT_LABEL, NAME_LABEL};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelOptions};
use crate::client::{Client, ClientBase, DriverClient};
use crate::composite::CompositeClient;
use crate::resolver::{ResolveError, ResolvePolicy, TypeRegistry};
use crate::scope::Scope;
use crate::ClientError;

/// Alias chains longer than this resolve to the generic client
const MAX_ALIAS_HOPS: usize = 16;

/// Fetch the exporter's reports over `channel` and build the client tree
///
/// Returns the root client. Every node is owned by `scope`. When
/// `use_alternative_endpoints` is set and the exporter advertises TLS
/// endpoints, the nodes talk over the first one that connects, dialled with
/// `channel`'s options; otherwise, or if none connects, they share
/// `channel`. A build failure leaves `scope` untouched.
pub async fn client_from_channel(
    channel: Channel,
    scope: &Scope,
    registry: &TypeRegistry,
    policy: &ResolvePolicy,
    use_alternative_endpoints: bool,
) -> Result<Arc<dyn Client>, ClientError> {
    let report = channel.get_report().await?;
    tracing::debug!(
        "Exporter {} reported {} instances",
        channel.address(),
        report.reports.len()
    );

    let channel = if use_alternative_endpoints && !report.alternative_endpoints.is_empty() {
        match dial_alternatives(&report.alternative_endpoints, channel.options()).await {
            Some(alternative) => alternative,
            None => channel,
        }
    } else {
        channel
    };

    build_tree(&report.reports, Some(&channel), scope, registry, policy)
}

/// Build an unconnected client tree straight from an exporter's `export`
/// table
///
/// The tree has the shape and client types a connected build of the same
/// configuration would have, under fresh ids. Every call on it fails with a
/// transport error. External mounts appear as generic leaves since their
/// remote trees are unknown.
pub fn client_stub(
    config: &ExporterConfig,
    scope: &Scope,
    registry: &TypeRegistry,
    policy: &ResolvePolicy,
) -> Result<Arc<dyn Client>, ClientError> {
    let reports = stub_reports(config, registry);
    tracing::debug!("Synthesized {} stub instances", reports.len());
    build_tree(&reports, None, scope, registry, policy)
}

fn build_tree(
    reports: &[InstanceReport],
    channel: Option<&Channel>,
    scope: &Scope,
    registry: &TypeRegistry,
    policy: &ResolvePolicy,
) -> Result<Arc<dyn Client>, ClientError> {
    let mut built: Vec<Arc<dyn Client>> = Vec::with_capacity(reports.len());
    let root = tree::build(reports, |instance, children| {
        let node = construct(instance, children, channel, scope, registry, policy)?;
        built.push(Arc::clone(&node));
        Ok::<_, ClientError>(node)
    })?;

    scope.adopt(built);
    Ok(root)
}

/// Connect to a local exporter socket and build its client tree
pub async fn client_from_path(
    path: &Path,
    scope: &Scope,
    registry: &TypeRegistry,
    policy: &ResolvePolicy,
    options: ChannelOptions,
) -> Result<Arc<dyn Client>, ClientError> {
    let target = format!("unix://{}", path.display());
    let channel = Channel::connect(&target, options).await?;
    client_from_channel(channel, scope, registry, policy, false).await
}

/// Connect as described by `config`, retrying per its backoff settings
pub async fn connect(config: &ClientConfig, scope: &Scope) -> Result<Arc<dyn Client>, ClientError> {
    let channel =
        Channel::connect_with_retry(&config.endpoint, ChannelOptions::from(config), &config.backoff)
            .await?;
    client_from_channel(
        channel,
        scope,
        &TypeRegistry::with_builtins(),
        &ResolvePolicy::from(&config.drivers),
        config.use_alternative_endpoints,
    )
    .await
}

fn construct(
    instance: &InstanceReport,
    children: BTreeMap<String, Arc<dyn Client>>,
    channel: Option<&Channel>,
    scope: &Scope,
    registry: &TypeRegistry,
    policy: &ResolvePolicy,
) -> Result<Arc<dyn Client>, ClientError> {
    let type_name = instance
        .client()
        .ok_or_else(|| ResolveError::Malformed(format!("<missing client label on {}>", instance.uuid)))?;
    let factory = registry.resolve(type_name, policy)?;
    let base = ClientBase::new(instance, channel.cloned(), children, scope.token().child_token());

    factory(base).map_err(|e| match e {
        ClientError::Construct { .. } => e,
        other => ClientError::Construct {
            type_name: type_name.to_string(),
            uuid: instance.uuid.clone(),
            reason: other.to_string(),
        },
    })
}

async fn dial_alternatives(
    endpoints: &[AlternativeEndpoint],
    options: &ChannelOptions,
) -> Option<Channel> {
    for endpoint in endpoints {
        if endpoint.certificate.is_empty() {
            continue;
        }
        match Channel::connect_alternative(endpoint, options.clone()).await {
            Ok(channel) => {
                tracing::info!("Using alternative endpoint {}", endpoint.endpoint);
                return Some(channel);
            }
            Err(e) => {
                tracing::warn!("Alternative endpoint {} unusable: {}", endpoint.endpoint, e);
            }
        }
    }
    None
}

/// One node of the export table, flattened
struct StubNode<'a> {
    uuid: String,
    parent: Option<usize>,
    name: &'a str,
    config: &'a DriverInstanceConfig,
}

fn stub_reports(config: &ExporterConfig, registry: &TypeRegistry) -> Vec<InstanceReport> {
    let mut nodes = Vec::new();
    let mut by_path = HashMap::new();
    flatten(&config.export, None, "", &mut nodes, &mut by_path);

    let root_uuid = uuid::Uuid::new_v4().to_string();
    let mut reports = Vec::with_capacity(nodes.len() + 1);
    reports.push(
        InstanceReport::new(root_uuid.clone(), None)
            .with_label(CLIENT_LABEL, CompositeClient::TYPE_NAME),
    );
    for node in &nodes {
        let parent = match node.parent {
            Some(index) => nodes[index].uuid.clone(),
            None => root_uuid.clone(),
        };
        let client = stub_client_type(node.config, &by_path, registry, 0);
        reports.push(
            InstanceReport::new(node.uuid.clone(), Some(parent))
                .with_label(NAME_LABEL, node.name)
                .with_label(CLIENT_LABEL, client),
        );
    }
    reports
}

fn flatten<'a>(
    table: &'a BTreeMap<String, DriverInstanceConfig>,
    parent: Option<usize>,
    prefix: &str,
    nodes: &mut Vec<StubNode<'a>>,
    by_path: &mut HashMap<String, &'a DriverInstanceConfig>,
) {
    for (name, config) in table {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let index = nodes.len();
        nodes.push(StubNode {
            uuid: uuid::Uuid::new_v4().to_string(),
            parent,
            name,
            config,
        });
        by_path.insert(path.clone(), config);

        let children = match config {
            DriverInstanceConfig::Base(base) => Some(&base.children),
            DriverInstanceConfig::Composite(composite) => Some(&composite.children),
            DriverInstanceConfig::Proxy(_) | DriverInstanceConfig::External(_) => None,
        };
        if let Some(children) = children {
            flatten(children, Some(index), &path, nodes, by_path);
        }
    }
}

/// Client type a connected build would report for `config`
///
/// Aliases take their target's type. A base driver named
/// `<package>_exporter.drivers.<module>.<Type>` maps to the client type
/// registered under `<package>_client.<module>`; anything else gets the
/// generic client.
fn stub_client_type(
    config: &DriverInstanceConfig,
    by_path: &HashMap<String, &DriverInstanceConfig>,
    registry: &TypeRegistry,
    hops: usize,
) -> String {
    match config {
        DriverInstanceConfig::Base(base) => client_type_for_driver(&base.type_name, registry)
            .unwrap_or_else(|| DriverClient::TYPE_NAME.to_string()),
        DriverInstanceConfig::Composite(_) => CompositeClient::TYPE_NAME.to_string(),
        DriverInstanceConfig::External(_) => DriverClient::TYPE_NAME.to_string(),
        DriverInstanceConfig::Proxy(proxy) => match by_path.get(&proxy.reference) {
            Some(target) if hops < MAX_ALIAS_HOPS => {
                stub_client_type(target, by_path, registry, hops + 1)
            }
            _ => DriverClient::TYPE_NAME.to_string(),
        },
    }
}

fn client_type_for_driver(driver_type: &str, registry: &TypeRegistry) -> Option<String> {
    let (package, rest) = driver_type.split_once("_exporter.drivers.")?;
    let module = rest.split('.').next()?;
    registry
        .types_in(&format!("{}_client.{}", package, module))
        .first()
        .map(|name| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkClient;
    use crate::power::PowerClient;

    const EXPORT: &str = r#"
[export.power]
type = "hwl_exporter.drivers.power.MockPower"

[export.dut]
ref = "bench.net"

[export.lab]
target = "unix:///run/hwlink/other.sock"

[export.bench.children.net]
type = "hwl_exporter.drivers.network.TcpNetwork"
config = { host = "127.0.0.1", port = 2222 }

[export.bench.children.rig]
type = "vendor_exporter.drivers.rig.Rig"
"#;

    fn policy() -> ResolvePolicy {
        ResolvePolicy::new(vec!["hwl_client.*".to_string()], false)
    }

    #[test]
    fn test_driver_type_maps_to_client_module() {
        let registry = TypeRegistry::with_builtins();
        assert_eq!(
            client_type_for_driver("hwl_exporter.drivers.power.MockPower", &registry).as_deref(),
            Some(PowerClient::TYPE_NAME)
        );
        assert_eq!(
            client_type_for_driver("hwl_exporter.drivers.composite.Composite", &registry).as_deref(),
            Some(CompositeClient::TYPE_NAME)
        );
        assert_eq!(client_type_for_driver("vendor_exporter.drivers.rig.Rig", &registry), None);
        assert_eq!(client_type_for_driver("not.a.driver", &registry), None);
    }

    #[tokio::test]
    async fn test_stub_mirrors_export_table() {
        let config: ExporterConfig = toml::from_str(EXPORT).unwrap();
        let scope = Scope::new();
        let root = client_stub(&config, &scope, &TypeRegistry::with_builtins(), &policy()).unwrap();

        assert!(root.base().channel().is_none());
        assert_eq!(scope.len(), 7);

        let root = root.downcast::<CompositeClient>().unwrap();
        assert!(root.base().child_as::<PowerClient>("power").is_some());
        assert!(root.base().child_as::<NetworkClient>("dut").is_some());
        assert!(root.base().child_as::<DriverClient>("lab").is_some());
        assert!(root.lookup("bench.net").unwrap().downcast::<NetworkClient>().is_some());
        assert!(root
            .lookup("bench.rig")
            .unwrap()
            .downcast::<DriverClient>()
            .is_some());

        let power = root.base().child_as::<PowerClient>("power").unwrap();
        let err = power.on().await.unwrap_err();
        assert_eq!(err.code, hwl_protocol::ErrorCode::Transport);
        assert!(err.message.contains("power"));

        scope.close();
    }

    #[test]
    fn test_stub_enforces_policy() {
        let config: ExporterConfig = toml::from_str(EXPORT).unwrap();
        let scope = Scope::new();
        let denied = ResolvePolicy::new(vec!["hwl_client.composite".to_string()], false);

        let result = client_stub(&config, &scope, &TypeRegistry::with_builtins(), &denied);
        assert!(result.is_err());
        assert!(scope.is_empty());
    }

    #[test]
    fn test_alias_cycle_falls_back_to_generic_client() {
        let config: ExporterConfig = toml::from_str(
            r#"
[export.a]
ref = "b"

[export.b]
ref = "a"
"#,
        )
        .unwrap();
        let scope = Scope::new();
        let root = client_stub(&config, &scope, &TypeRegistry::with_builtins(), &policy()).unwrap();
        assert!(root.base().child_as::<DriverClient>("a").is_some());
        assert!(root.base().child_as::<DriverClient>("b").is_some());
    }
}
