//! End-to-end tests: real exporters on loopback sockets, real clients

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hwl_client::{
    client_from_channel, Channel, ChannelOptions, Client, CompositeClient, DriverClient,
    NetworkClient, Portal, PowerClient, PowerReading, ResolvePolicy, Scope, TypeRegistry,
};
use hwl_core::config::{DriverInstanceConfig, ExternalInstanceConfig};
use hwl_core::traits::{StreamReceiver, StreamSender};
use hwl_core::{CallError, StreamError};
use hwl_exporter::driver::ValueStream;
use hwl_exporter::drivers::{Composite, MockPower, Proxy, TcpNetwork, TcpNetworkConfig};
use hwl_exporter::{Driver, DriverBase, DriverRegistry, ExporterServer};
use hwl_protocol::ErrorCode;

const PATIENCE: Duration = Duration::from_secs(5);

/// `hang` never answers; `count` streams 0, 1, 2, ... forever
struct Sluggish {
    base: DriverBase,
}

#[async_trait]
impl Driver for Sluggish {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        DriverClient::TYPE_NAME
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        match method {
            "hang" => std::future::pending().await,
            _ => Err(CallError::method_not_found(method)),
        }
    }

    async fn streaming_call(&self, method: &str, _args: Vec<Value>) -> Result<ValueStream, CallError> {
        match method {
            "count" => Ok(futures::stream::iter(0u64..).map(|n| Ok::<_, CallError>(json!(n))).boxed()),
            _ => Err(CallError::method_not_found(method)),
        }
    }
}

/// TCP echo service; reports each connection it finishes serving
async fn spawn_echo() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = echo.local_addr().unwrap();
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = echo.accept().await {
            let finished = finished_tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = finished.send(());
            });
        }
    });
    (addr, finished_rx)
}

/// Exporter serving `power` (MockPower), `net` (TcpNetwork to `echo`) and
/// `slow` (Sluggish)
async fn spawn_bench(
    echo: SocketAddr,
    alternative_endpoints: &[String],
    cancel: &CancellationToken,
) -> (String, Arc<MockPower>) {
    let power = Arc::new(MockPower::new(DriverBase::new()));
    let network: Arc<dyn Driver> = Arc::new(TcpNetwork::new(
        DriverBase::new(),
        TcpNetworkConfig {
            host: echo.ip().to_string(),
            port: echo.port(),
        },
    ));
    let slow: Arc<dyn Driver> = Arc::new(Sluggish {
        base: DriverBase::new(),
    });
    let root = composite(vec![
        ("power", Arc::clone(&power) as Arc<dyn Driver>),
        ("net", network),
        ("slow", slow),
    ]);
    let (address, _) = spawn_exporter(root, alternative_endpoints, cancel).await;
    (address, power)
}

async fn echo_exact(socket: &mut tokio::net::TcpStream, payload: &[u8]) {
    socket.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(PATIENCE, socket.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

fn policy() -> ResolvePolicy {
    ResolvePolicy::new(vec!["hwl_client.*".to_string()], false)
}

fn composite(children: Vec<(&str, Arc<dyn Driver>)>) -> Arc<dyn Driver> {
    let children: BTreeMap<_, _> = children
        .into_iter()
        .map(|(name, driver)| (name.to_string(), driver))
        .collect();
    Arc::new(Composite::new(
        DriverBase::new().with_children(children),
    ))
}

/// Serve `root` on an ephemeral loopback port
async fn spawn_exporter(
    root: Arc<dyn Driver>,
    alternative_endpoints: &[String],
    cancel: &CancellationToken,
) -> (String, ExporterServer) {
    let server = ExporterServer::start(root, alternative_endpoints, cancel.clone())
        .await
        .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("tcp://{}", listener.local_addr().unwrap());

    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve_tcp(listener).await.unwrap();
    });
    (address, server)
}

/// An exporter whose only export mounts `target`
async fn spawn_mounting_exporter(target: &str, cancel: &CancellationToken) -> String {
    let mut export = BTreeMap::new();
    export.insert(
        "lab".to_string(),
        DriverInstanceConfig::External(ExternalInstanceConfig {
            target: target.to_string(),
        }),
    );
    let root = DriverRegistry::with_builtins()
        .instantiate_root(&export)
        .await
        .unwrap();
    spawn_exporter(root, &[], cancel).await.0
}

async fn client_tree(address: &str, scope: &Scope) -> Arc<dyn Client> {
    let channel = Channel::connect(address, ChannelOptions::default())
        .await
        .unwrap();
    client_from_channel(channel, scope, &TypeRegistry::with_builtins(), &policy(), false)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_level_external_mount_is_transparent() {
    let cancel = CancellationToken::new();
    let power: Arc<dyn Driver> = Arc::new(MockPower::new(DriverBase::new()));
    let (direct, _) = spawn_exporter(composite(vec![("power", power)]), &[], &cancel).await;
    let once = spawn_mounting_exporter(&direct, &cancel).await;
    let twice = spawn_mounting_exporter(&once, &cancel).await;

    let scope = Scope::new();
    let direct_root = client_tree(&direct, &scope).await;
    let mounted_root = client_tree(&twice, &scope).await;

    let mounted = mounted_root
        .downcast::<CompositeClient>()
        .unwrap()
        .lookup("lab.lab.power")
        .unwrap()
        .downcast::<PowerClient>()
        .unwrap();
    let direct_power = direct_root.base().child_as::<PowerClient>("power").unwrap();

    // Same driver behind both ids
    assert_eq!(mounted.base().uuid(), direct_power.base().uuid());

    mounted.on().await.unwrap();
    mounted.off().await.unwrap();

    let readings: Vec<PowerReading> = mounted
        .read()
        .await
        .unwrap()
        .map(|reading| reading.unwrap())
        .collect()
        .await;
    assert_eq!(
        readings,
        vec![
            PowerReading { voltage: 0.0, current: 0.0 },
            PowerReading { voltage: 5.0, current: 2.0 },
        ]
    );

    let through_mounts = mounted.base().call("explode", vec![]).await.unwrap_err();
    let direct_err = direct_power.base().call("explode", vec![]).await.unwrap_err();
    assert_eq!(through_mounts.code, ErrorCode::MethodNotFound);
    assert_eq!(through_mounts, direct_err);

    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_network_port_forward_through_exporter() {
    let cancel = CancellationToken::new();

    // Echo service the driver connects to
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = echo.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let network: Arc<dyn Driver> = Arc::new(TcpNetwork::new(
        DriverBase::new(),
        TcpNetworkConfig {
            host: echo_addr.ip().to_string(),
            port: echo_addr.port(),
        },
    ));
    let (address, _) = spawn_exporter(composite(vec![("net", network)]), &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let net = root.base().child_as::<NetworkClient>("net").unwrap();

    // Direct stream
    let mut stream = net.connect().await.unwrap();
    stream.send(Bytes::from_static(b"hello")).await.unwrap();
    let mut echoed = Vec::new();
    while echoed.len() < 5 {
        match stream.receive().await.unwrap() {
            Some(chunk) => echoed.extend_from_slice(&chunk),
            None => break,
        }
    }
    assert_eq!(echoed, b"hello");
    stream.close().await.unwrap();

    // Local port forward
    let forward = net
        .portforward_tcp("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let mut local = tokio::net::TcpStream::connect(forward.local_addr().unwrap())
        .await
        .unwrap();
    local.write_all(b"tunnel").await.unwrap();
    let mut buf = [0u8; 6];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel");

    drop(local);
    forward.close().await;
    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_alias_calls_reach_target() {
    let cancel = CancellationToken::new();
    let power = Arc::new(MockPower::new(DriverBase::new()));
    let bench = composite(vec![("power", Arc::clone(&power) as Arc<dyn Driver>)]);
    let alias: Arc<dyn Driver> = Arc::new(Proxy::new(DriverBase::new(), "bench.power"));
    let root = composite(vec![("bench", bench), ("dut", alias)]);
    let (address, _) = spawn_exporter(root, &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let dut = root.base().child_as::<PowerClient>("dut").unwrap();
    let original = root
        .downcast::<CompositeClient>()
        .unwrap()
        .lookup("bench.power")
        .unwrap();

    assert_ne!(dut.base().uuid(), original.base().uuid());

    dut.on().await.unwrap();
    assert!(power.is_on());
    dut.off().await.unwrap();
    assert!(!power.is_on());

    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_alternative_endpoint_serves_same_tree() {
    let cancel = CancellationToken::new();
    let power = Arc::new(MockPower::new(DriverBase::new()));
    let root = composite(vec![("power", Arc::clone(&power) as Arc<dyn Driver>)]);
    let (address, server) =
        spawn_exporter(root, &["127.0.0.1:0".to_string()], &cancel).await;

    let advertised = server.session().alternative_endpoints();
    assert_eq!(advertised.len(), 1);
    assert!(!advertised[0].endpoint.ends_with(":0"));

    // Dial the TLS endpoint directly
    let tls = Channel::connect_alternative(&advertised[0], ChannelOptions::default())
        .await
        .unwrap();
    let report = tls.get_report().await.unwrap();
    assert_eq!(report.reports.len(), 2);
    assert_eq!(report.alternative_endpoints, advertised.to_vec());

    // Let the client tree switch over on its own
    let channel = Channel::connect(&address, ChannelOptions::default())
        .await
        .unwrap();
    let scope = Scope::new();
    let root = client_from_channel(channel, &scope, &TypeRegistry::with_builtins(), &policy(), true)
        .await
        .unwrap();
    assert!(root.base().channel().unwrap().address().starts_with("tls://"));

    let client = root.base().child_as::<PowerClient>("power").unwrap();
    client.on().await.unwrap();
    assert!(power.is_on());

    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_tls_endpoint_requires_client_identity() {
    let cancel = CancellationToken::new();
    let root = composite(vec![]);
    let (_, server) = spawn_exporter(root, &["127.0.0.1:0".to_string()], &cancel).await;

    // A client presenting a different identity is refused
    let mut forged = server.session().alternative_endpoints()[0].clone();
    let other = hwl_exporter::EndpointCredentials::generate(&[forged.endpoint.parse().unwrap()])
        .unwrap()
        .advertise(&forged.endpoint.parse().unwrap());
    forged.client_certificate = other.client_certificate;
    forged.client_private_key = other.client_private_key;

    let result = Channel::connect_alternative(&forged, ChannelOptions::default()).await;
    assert!(result.is_err());

    cancel.cancel();
}

#[test]
fn test_portal_drives_blocking_caller() {
    let portal = Portal::start().unwrap();
    let cancel = CancellationToken::new();

    let address = portal
        .call({
            let cancel = cancel.clone();
            async move {
                let power: Arc<dyn Driver> = Arc::new(MockPower::new(DriverBase::new()));
                spawn_exporter(composite(vec![("power", power)]), &[], &cancel)
                    .await
                    .0
            }
        })
        .unwrap();

    let outcome = portal
        .call(async move {
            let scope = Scope::new();
            let root = client_tree(&address, &scope).await;
            let power = root.base().child_as::<PowerClient>("power").unwrap();
            let result = power.on().await;
            scope.close();
            result
        })
        .unwrap();
    assert!(outcome.is_ok());

    cancel.cancel();
    portal.stop();
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_other_calls() {
    let cancel = CancellationToken::new();
    let (echo, _) = spawn_echo().await;
    let (address, power) = spawn_bench(echo, &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let net = root.base().child_as::<NetworkClient>("net").unwrap();
    let power_client = root.base().child_as::<PowerClient>("power").unwrap();

    // Writes 16 MiB and never reads the echo
    let mut stream = net.connect().await.unwrap();
    let flood = tokio::spawn(async move {
        let chunk = Bytes::from(vec![0xA5; 4096]);
        for _ in 0..4096 {
            if stream.send(chunk.clone()).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(PATIENCE, power_client.on())
        .await
        .expect("call stalled behind an unread stream")
        .unwrap();
    assert!(power.is_on());
    timeout(PATIENCE, power_client.off()).await.unwrap().unwrap();
    assert!(!power.is_on());

    scope.close();
    timeout(PATIENCE, flood).await.unwrap().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn test_oversized_send_is_split_and_echoed() {
    let cancel = CancellationToken::new();
    let (echo, _) = spawn_echo().await;
    let (address, _) = spawn_bench(echo, &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let net = root.base().child_as::<NetworkClient>("net").unwrap();
    let power = root.base().child_as::<PowerClient>("power").unwrap();

    let total = hwl_protocol::MAX_PAYLOAD_SIZE + 1024 * 1024;
    let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let (mut tx, mut rx) = net.connect().await.unwrap().split();

    let outgoing = Bytes::from(payload.clone());
    let writer = tokio::spawn(async move { tx.send(outgoing).await });

    let mut echoed = Vec::with_capacity(total);
    while echoed.len() < total {
        match timeout(PATIENCE, rx.receive()).await.unwrap().unwrap() {
            Some(chunk) => echoed.extend_from_slice(&chunk),
            None => break,
        }
    }
    writer.await.unwrap().unwrap();
    assert_eq!(echoed.len(), total);
    assert!(echoed == payload);

    // The connection survived the large write
    timeout(PATIENCE, power.on()).await.unwrap().unwrap();

    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_scope_close_stops_open_streams() {
    let cancel = CancellationToken::new();
    let (echo, mut finished) = spawn_echo().await;
    let (address, _) = spawn_bench(echo, &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let net = root.base().child_as::<NetworkClient>("net").unwrap();
    let slow = root.base().child_as::<DriverClient>("slow").unwrap();

    let mut stream = net.connect().await.unwrap();
    stream.send(Bytes::from_static(b"before")).await.unwrap();
    let mut seen = Vec::new();
    while seen.len() < 6 {
        seen.extend_from_slice(&stream.receive().await.unwrap().unwrap());
    }

    let mut counting = slow.base().streaming_call("count", vec![]).await.unwrap();
    assert_eq!(counting.next().await.unwrap().unwrap(), json!(0));

    scope.close();

    assert!(matches!(
        stream.send(Bytes::from_static(b"after-close")).await,
        Err(StreamError::Cancelled)
    ));
    assert!(matches!(stream.receive().await, Err(StreamError::Cancelled)));

    let err = counting.next().await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
    assert!(counting.next().await.is_none());

    // The exporter tore down its side of the relay
    timeout(PATIENCE, finished.recv()).await.unwrap().unwrap();

    cancel.cancel();
}

#[tokio::test]
async fn test_alternative_channel_keeps_call_timeout() {
    let cancel = CancellationToken::new();
    let (echo, _) = spawn_echo().await;
    let (address, _) = spawn_bench(echo, &["127.0.0.1:0".to_string()], &cancel).await;

    let options = ChannelOptions {
        connect_timeout: Duration::from_secs(5),
        call_timeout: Some(Duration::from_millis(300)),
    };
    let channel = Channel::connect(&address, options).await.unwrap();
    let scope = Scope::new();
    let root = client_from_channel(channel, &scope, &TypeRegistry::with_builtins(), &policy(), true)
        .await
        .unwrap();

    let switched = root.base().channel().unwrap();
    assert!(switched.address().starts_with("tls://"));
    assert_eq!(switched.options().call_timeout, Some(Duration::from_millis(300)));

    let slow = root.base().child_as::<DriverClient>("slow").unwrap();
    let err = timeout(PATIENCE, slow.base().call("hang", vec![]))
        .await
        .expect("call over the alternative channel was not bounded")
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);

    scope.close();
    cancel.cancel();
}

#[tokio::test]
async fn test_forwarded_connections_are_isolated() {
    let cancel = CancellationToken::new();
    let (echo, mut finished) = spawn_echo().await;
    let (address, _) = spawn_bench(echo, &[], &cancel).await;

    let scope = Scope::new();
    let root = client_tree(&address, &scope).await;
    let net = root.base().child_as::<NetworkClient>("net").unwrap();
    let forward = net
        .portforward_tcp("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let local = forward.local_addr().unwrap();

    let mut first = tokio::net::TcpStream::connect(local).await.unwrap();
    let mut second = tokio::net::TcpStream::connect(local).await.unwrap();
    echo_exact(&mut first, b"first").await;
    echo_exact(&mut second, b"second").await;

    // Kill the first connection mid-session
    first.write_all(b"unfinished").await.unwrap();
    drop(first);
    timeout(PATIENCE, finished.recv()).await.unwrap().unwrap();

    echo_exact(&mut second, b"still here").await;
    let third = tokio::net::TcpStream::connect(local).await;
    echo_exact(&mut third.unwrap(), b"third").await;

    drop(second);
    forward.close().await;
    scope.close();
    cancel.cancel();
}
