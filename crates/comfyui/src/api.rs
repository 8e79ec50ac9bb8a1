//! HTTP side of a ComfyUI server.
//!
//! [`ComfyUIApi`] implements [`ComfyService`] over the server's own
//! endpoints (prompt queue, history, interrupt, node registry) and the
//! manager extension's catalog and install endpoints.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::catalog::{CustomNodeEntry, CustomNodeList, HistoryEntry, NodeMappings, QueueState};
use crate::service::ComfyService;

const SYSTEM_STATS: &str = "/system_stats";
const PROMPT: &str = "/prompt";
const HISTORY: &str = "/history";
const QUEUE: &str = "/queue";
const INTERRUPT: &str = "/interrupt";
const OBJECT_INFO: &str = "/object_info";
const MANAGER_LIST: &str = "/customnode/getlist?mode=local";
const MANAGER_MAPPINGS: &str = "/customnode/getmappings?mode=local";
const MANAGER_INSTALL: &str = "/customnode/install";

/// Reply to a successful `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position.
    #[serde(default)]
    pub number: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx answer; `body` is kept verbatim for the log.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// The server refused to queue the graph. `node_errors` maps node ids
    /// to the validation failures reported for them.
    #[error("Prompt rejected: {message}")]
    Rejected { message: String, node_errors: Value },
}

/// HTTP client for one ComfyUI server.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// `api_url` is the base URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Share a connection pool with other users of `client`.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    async fn send(request: RequestBuilder) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, ComfyUIApiError> {
        let response = Self::send(self.client.get(self.url(path))).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Turn a 400 from `/prompt` into [`ComfyUIApiError::Rejected`] when the
/// body has the server's validation shape.
fn rejection(err: ComfyUIApiError) -> ComfyUIApiError {
    let ComfyUIApiError::ApiError { status, body } = &err else {
        return err;
    };
    if *status != StatusCode::BAD_REQUEST.as_u16() {
        return err;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return err;
    };
    let message = match &parsed["error"] {
        Value::String(s) => s.clone(),
        Value::Object(e) => e
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("invalid prompt")
            .to_string(),
        _ => return err,
    };
    ComfyUIApiError::Rejected {
        message,
        node_errors: parsed.get("node_errors").cloned().unwrap_or(Value::Null),
    }
}

#[async_trait]
impl ComfyService for ComfyUIApi {
    /// Something answering with a non-2xx status is not a healthy server.
    async fn health_check(&self) -> Result<bool, ComfyUIApiError> {
        let response = self.client.get(self.url(SYSTEM_STATS)).send().await?;
        Ok(response.status().is_success())
    }

    async fn queue_prompt(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let request = self
            .client
            .post(self.url(PROMPT))
            .json(&json!({ "prompt": workflow, "client_id": client_id }));
        let response = Self::send(request).await.map_err(rejection)?;
        Ok(response.json().await?)
    }

    /// The server answers `{prompt_id: {...}}`, or `{}` while the prompt
    /// is unknown or still running.
    async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let mut body: Map<String, Value> = self.fetch(&format!("{HISTORY}/{prompt_id}")).await?;
        match body.remove(prompt_id) {
            None => Ok(None),
            Some(entry) => match serde_json::from_value(entry) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "Unreadable history entry");
                    Ok(None)
                }
            },
        }
    }

    async fn get_queue(&self) -> Result<QueueState, ComfyUIApiError> {
        self.fetch(QUEUE).await
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        Self::send(self.client.post(self.url(INTERRUPT))).await?;
        Ok(())
    }

    async fn get_registered_nodes(&self) -> Result<HashSet<String>, ComfyUIApiError> {
        let info: Map<String, Value> = self.fetch(OBJECT_INFO).await?;
        Ok(info.into_iter().map(|(class_type, _)| class_type).collect())
    }

    async fn get_custom_node_list(&self) -> Result<Vec<CustomNodeEntry>, ComfyUIApiError> {
        let list: CustomNodeList = self.fetch(MANAGER_LIST).await?;
        Ok(list.custom_nodes)
    }

    async fn get_node_mappings(&self) -> Result<NodeMappings, ComfyUIApiError> {
        let raw: Value = self.fetch(MANAGER_MAPPINGS).await?;
        Ok(NodeMappings::from_value(&raw))
    }

    /// The entry is posted back exactly as the catalog listed it.
    async fn install_custom_node(&self, entry: &CustomNodeEntry) -> Result<(), ComfyUIApiError> {
        Self::send(self.client.post(self.url(MANAGER_INSTALL)).json(entry)).await?;
        Ok(())
    }
}
