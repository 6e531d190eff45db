//! Exporter server: listeners and per-connection protocol handling

mod handler;
mod listener;

pub use handler::{ConnectionHandler, HANDSHAKE_TIMEOUT};
pub use listener::ExporterServer;
