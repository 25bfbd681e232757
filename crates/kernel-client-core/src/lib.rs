//! Core abstractions for driving a remote compute kernel.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Wire messages exchanged over the kernel channel
//! - `OutputItem` / `classify` - Typed program output
//! - `ExecutionTracker` - Session state machine
//! - `OutputBus` - Per-session pub/sub for output items
//! - `ImageArena` - Session-owned image payload storage
//! - `KernelApi` / `ChannelConnector` - Transport traits

pub mod config;
pub mod error;
pub mod images;
pub mod output;
pub mod output_bus;
pub mod tracker;
pub mod traits;
pub mod wire;

pub use config::{ServerConfig, SessionOptions, Timeouts};
pub use error::{ProtocolError, SessionError, TransportError};
pub use images::{ImageArena, ImageFormat, ImageKey};
pub use output::{Classified, DisplayOrigin, OutputItem, StreamName, classify};
pub use output_bus::{OutputBus, Subscription};
pub use tracker::{ExecutionRequest, ExecutionTracker, SessionStatus};
pub use traits::{ChannelConnector, KernelApi, KernelChannel, KernelId, KernelInfo};
pub use wire::{Envelope, ExecutionState, MsgId};
