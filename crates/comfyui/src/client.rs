//! Event socket of a ComfyUI server.
//!
//! The server routes a prompt's execution frames only to the socket that
//! connected with the same `clientId` the prompt was queued under, so
//! each run opens its own connection through [`ComfyUIClient`].

use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::connect_async;

use crate::service::{EventConnector, EventStream};

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("Failed to connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// `http://host:8188` becomes `ws://host:8188` and `https://` becomes
/// `wss://`. A bare `host:port` gets `ws://`.
pub fn ws_url_from_http(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    }
}

/// Opens event streams against one server.
pub struct ComfyUIClient {
    ws_url: String,
}

impl ComfyUIClient {
    /// `ws_url` is the socket base, e.g. `ws://127.0.0.1:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    fn endpoint(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={client_id}", self.ws_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EventConnector for ComfyUIClient {
    async fn connect(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError> {
        let url = self.endpoint(client_id);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|source| ComfyUIClientError::Connection { url: url.clone(), source })?;

        tracing::debug!(client_id = %client_id, url = %url, "Event stream open");
        Ok(socket.boxed())
    }
}
