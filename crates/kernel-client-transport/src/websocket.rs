//! WebSocket transport for the kernel channels endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use kernel_client_core::{ChannelConnector, KernelChannel, ServerConfig, TransportError};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

fn ws_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::WebSocket(e.to_string())
}

/// Opens kernel channels over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: ServerConfig,
    open_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub const fn new(config: ServerConfig, open_timeout: Duration) -> Self {
        Self {
            config,
            open_timeout,
        }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(
        &self,
        kernel_id: &str,
        session_id: &str,
    ) -> Result<KernelChannel, TransportError> {
        let url = self.config.channels_url(kernel_id, session_id)?;
        let mut request = url.as_str().into_client_request().map_err(ws_error)?;
        if let Some(auth) = self.config.auth_header() {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| TransportError::InvalidUrl(format!("Invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio::time::timeout(self.open_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(self.open_timeout))?
            .map_err(ws_error)?;
        tracing::debug!(kernel_id, "Kernel channel connected");

        let (mut sink, stream) = socket.split();

        // Channel for sending frames to the kernel
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Spawn task to forward frames to WebSocket; ends when every sender is dropped
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::warn!("Failed to send frame: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 binary frame");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(e) => Some(Err(ws_error(e))),
                })
            });

        Ok(KernelChannel::new(tx, inbound))
    }
}
