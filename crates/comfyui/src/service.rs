//! Collaborator traits for talking to a ComfyUI server.
//!
//! [`ComfyService`] covers the request/response operations and
//! [`EventConnector`] opens the per-client event stream. The pipeline
//! only depends on these traits, so tests can substitute in-memory
//! doubles for the real HTTP and WebSocket clients.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::api::{ComfyUIApiError, SubmitResponse};
use crate::catalog::{CustomNodeEntry, HistoryEntry, NodeMappings, QueueState};
use crate::client::ComfyUIClientError;

/// Frames received from the server's event socket.
pub type EventStream = BoxStream<'static, Result<Message, tungstenite::Error>>;

/// Request/response operations against one ComfyUI server.
#[async_trait]
pub trait ComfyService: Send + Sync {
    /// `true` when the server answers its stats endpoint successfully.
    async fn health_check(&self) -> Result<bool, ComfyUIApiError>;

    /// Enqueue an API-format graph tagged with `client_id`.
    async fn queue_prompt(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// History record for one prompt, `None` if the server has none.
    async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;

    /// Running and pending queue rows.
    async fn get_queue(&self) -> Result<QueueState, ComfyUIApiError>;

    /// Interrupt whatever is executing right now.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    /// Class types the server currently has registered.
    async fn get_registered_nodes(&self) -> Result<HashSet<String>, ComfyUIApiError>;

    /// The manager's installable custom-node catalog.
    async fn get_custom_node_list(&self) -> Result<Vec<CustomNodeEntry>, ComfyUIApiError>;

    /// Source URL -> provided class types.
    async fn get_node_mappings(&self) -> Result<NodeMappings, ComfyUIApiError>;

    /// Ask the manager to install one catalog entry.
    async fn install_custom_node(&self, entry: &CustomNodeEntry) -> Result<(), ComfyUIApiError>;
}

/// Opens the server's event stream for a given correlation tag.
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError>;
}
