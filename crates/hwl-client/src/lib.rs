//! hwl-client: Client side of hwlink
//!
//! Connects to an exporter, fetches its flat instance list and rebuilds it
//! as a tree of typed client objects sharing one multiplexed channel.
//! Also provides local port forwarding through network drivers and a
//! blocking portal for synchronous callers.

pub mod channel;
pub mod client;
pub mod composite;
pub mod connect;
pub mod error;
pub mod network;
pub mod portal;
pub mod power;
pub mod resolver;
pub mod scope;
pub mod tunnel;

pub use channel::{Channel, ChannelOptions, ExporterReport, ValueStream};
pub use client::{Client, ClientBase, DriverClient};
pub use composite::CompositeClient;
pub use connect::{client_from_channel, client_from_path, client_stub, connect};
pub use error::ClientError;
pub use network::NetworkClient;
pub use portal::{Portal, PortalError};
pub use power::{PowerClient, PowerReading};
pub use resolver::{ClientFactory, ResolveError, ResolvePolicy, TypeRegistry};
pub use scope::Scope;
pub use tunnel::{ForwardAddr, PortForward, StreamTarget};
