//! Built-in drivers

pub mod composite;
pub mod external;
pub mod network;
pub mod power;

pub use composite::{Composite, Proxy};
pub use external::{External, ExternalStub};
pub use network::{TcpNetwork, TcpNetworkConfig};
pub use power::MockPower;
