//! rpcweb server: HTTP and socket front end that routes requests to
//! registered RPC processors.

pub mod network;
pub mod service;

pub use network::{NetworkConfig, NetworkModule};
pub use service::{ServiceOptions, ServiceRegistry};
