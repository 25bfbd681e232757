//! Transports for talking to a kernel server.
//!
//! Provides:
//! - REST client for kernel lifecycle calls
//! - WebSocket kernel channel (feature: websocket)
//! - In-process scripted kernel (feature: memory)
//! - Connectivity probe and monitor

pub mod connectivity;
pub mod rest;

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use connectivity::{Connectivity, ConnectivityMonitor, probe};
pub use rest::RestClient;

#[cfg(feature = "memory")]
pub use memory::{MemoryKernel, Step};
#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
