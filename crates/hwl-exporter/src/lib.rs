//! hwl-exporter: Serves a tree of hardware drivers to hwlink clients
//!
//! The exporter instantiates drivers from configuration, enumerates them
//! into a flat instance list and answers client requests over a framed,
//! multiplexed connection. Subtrees of other exporters can be mounted with
//! external nodes, and alternative TLS endpoints let clients dial in
//! directly.

pub mod driver;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

pub use driver::{Driver, DriverBase, EnumerateContext, Instance};
pub use error::{ExportError, TlsError};
pub use registry::DriverRegistry;
pub use server::{ConnectionHandler, ExporterServer};
pub use session::Session;
pub use tls::EndpointCredentials;
