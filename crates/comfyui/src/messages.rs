//! Event-socket frames and their parser.
//!
//! Every text frame is an envelope `{"type": "<kind>", "data": {...}}`.
//! The envelope is read first and the payload decoded by kind, so frames
//! from custom nodes with their own kinds come back as
//! [`ComfyUIMessage::Other`] instead of failing to parse.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast; the server sends one on connect.
    Status { queue_remaining: Option<u32> },
    ExecutionStart(PromptRef),
    /// Nodes skipped because their outputs were cached.
    ExecutionCached(CachedData),
    /// `node` is `None` once the whole prompt has run.
    Executing(ExecutingData),
    Progress(ProgressData),
    Executed(ExecutedData),
    ExecutionError(ErrorData),
    ExecutionInterrupted(InterruptedData),
    ExecutionSuccess(PromptRef),
    /// Any kind not listed above.
    Other(String),
}

impl ComfyUIMessage {
    /// Prompt the frame belongs to, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => Some(&d.prompt_id),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::Status { .. } | Self::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: String,
}

/// Sampler step progress within one node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressData {
    /// Absent on older servers.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    pub value: u32,
    pub max: u32,
}

impl ProgressData {
    /// Completion of the current node, 0 to 100.
    pub fn percent(&self) -> i16 {
        if self.max == 0 {
            return 0;
        }
        (u64::from(self.value.min(self.max)) * 100 / u64::from(self.max)) as i16
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub prompt_id: String,
    /// Same shape as one node's entry in the history outputs.
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame.
///
/// Fails on malformed JSON, on a missing `type`, or when a known kind
/// carries a payload of the wrong shape.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let msg = match kind.as_str() {
        "status" => ComfyUIMessage::Status {
            queue_remaining: data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(Value::as_u64)
                .map(|n| n.min(u64::from(u32::MAX)) as u32),
        },
        "execution_start" => ComfyUIMessage::ExecutionStart(payload(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(payload(data)?),
        "executing" => ComfyUIMessage::Executing(payload(data)?),
        "progress" => ComfyUIMessage::Progress(payload(data)?),
        "executed" => ComfyUIMessage::Executed(payload(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(payload(data)?),
        "execution_interrupted" => ComfyUIMessage::ExecutionInterrupted(payload(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(payload(data)?),
        _ => ComfyUIMessage::Other(kind),
    };
    Ok(msg)
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}
