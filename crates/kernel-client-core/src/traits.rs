//! Transport traits the session client is written against.

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Server-assigned kernel identifier.
pub type KernelId = String;

/// A kernel as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: KernelId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub connections: Option<u64>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

/// REST side of a kernel server.
#[async_trait]
pub trait KernelApi: Send + Sync {
    /// Start a new kernel.
    async fn create_kernel(&self) -> Result<KernelInfo, TransportError>;

    /// List running kernels.
    async fn list_kernels(&self) -> Result<Vec<KernelInfo>, TransportError>;

    /// Delete a kernel. Deleting a kernel that no longer exists succeeds.
    async fn delete_kernel(&self, kernel_id: &str) -> Result<(), TransportError>;

    /// Ask the kernel to interrupt whatever it is running.
    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), TransportError>;
}

/// An open, bidirectional message channel to one kernel.
///
/// Frames are JSON text. Dropping `outbound` closes the connection.
pub struct KernelChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: BoxStream<'static, Result<String, TransportError>>,
}

impl KernelChannel {
    #[must_use]
    pub fn new<S>(outbound: mpsc::UnboundedSender<String>, inbound: S) -> Self
    where
        S: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            outbound,
            inbound: inbound.boxed(),
        }
    }
}

/// Opens the streaming channel of a kernel.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, kernel_id: &str, session_id: &str)
    -> Result<KernelChannel, TransportError>;
}
