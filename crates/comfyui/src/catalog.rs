//! Payload types returned by the ComfyUI and ComfyUI-Manager endpoints.
//!
//! These cover the custom-node catalog, the class-type mapping table,
//! the live queue and per-prompt execution history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Install type used for plain repository clones.
pub const INSTALL_TYPE_GIT_CLONE: &str = "git-clone";

// ---------------------------------------------------------------------------
// Custom-node catalog
// ---------------------------------------------------------------------------

/// One installable entry of the manager's custom-node catalog.
///
/// Unknown fields are kept in `extra` so the entry can be posted back to
/// the install endpoint unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomNodeEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    /// Source repository URL.
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub install_type: String,
    #[serde(default)]
    pub description: String,
    /// `true`/`false`, or a string state such as `"False"`, `"True"`,
    /// `"Update"` depending on the manager version.
    #[serde(default)]
    pub installed: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename_pattern: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CustomNodeEntry {
    /// Minimal descriptor for a repository that is not in the catalog.
    pub fn git_clone(url: &str) -> Self {
        Self {
            title: String::new(),
            author: String::new(),
            reference: url.to_string(),
            files: vec![url.to_string()],
            install_type: INSTALL_TYPE_GIT_CLONE.to_string(),
            description: String::new(),
            installed: Value::String("False".to_string()),
            nodename_pattern: None,
            extra: Map::new(),
        }
    }

    /// The install source that identifies this entry (`files[0]`).
    pub fn primary_file(&self) -> Option<&str> {
        self.files.first().map(String::as_str)
    }

    /// Whether the manager reports this entry as installed.
    pub fn is_installed(&self) -> bool {
        match &self.installed {
            Value::Bool(b) => *b,
            Value::String(s) => s != "False",
            Value::Null => false,
            _ => true,
        }
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.reference
        } else {
            &self.title
        }
    }
}

/// Envelope returned by `GET /customnode/getlist`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomNodeList {
    #[serde(default)]
    pub custom_nodes: Vec<CustomNodeEntry>,
}

/// Source URL -> class types it provides, from `GET /customnode/getmappings`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMappings(pub HashMap<String, Vec<String>>);

impl NodeMappings {
    /// Parse the raw mapping payload `{url: [[names...], {meta}]}`.
    ///
    /// Entries with an unexpected shape are skipped.
    pub fn from_value(value: &Value) -> Self {
        let mut map = HashMap::new();
        if let Some(obj) = value.as_object() {
            for (url, entry) in obj {
                let names: Vec<String> = entry
                    .get(0)
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                map.insert(url.clone(), names);
            }
        }
        Self(map)
    }

    /// Invert into class type -> source URL.
    pub fn name_to_url(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .flat_map(|(url, names)| names.iter().map(move |n| (n.clone(), url.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// One raw queue row: `[number, prompt_id, prompt, extra_data, outputs]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct QueueItem(pub Vec<Value>);

impl QueueItem {
    /// The correlation tag the job was submitted with, if any.
    ///
    /// `extra_data` is the second-to-last element of the row.
    pub fn client_id(&self) -> Option<&str> {
        let len = self.0.len();
        if len < 2 {
            return None;
        }
        self.0[len - 2].get("client_id")?.as_str()
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.0.get(1)?.as_str()
    }
}

/// Snapshot of `GET /queue`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue_running: Vec<QueueItem>,
    #[serde(default)]
    pub queue_pending: Vec<QueueItem>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A file produced by an output node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputFileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Everything one node produced.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFileRef>,
    #[serde(default)]
    pub gifs: Vec<OutputFileRef>,
    #[serde(default)]
    pub text: Vec<Value>,
}

impl NodeOutput {
    /// Media files in the order they are harvested: gifs, then images.
    pub fn files(&self) -> impl Iterator<Item = &OutputFileRef> {
        self.gifs.iter().chain(self.images.iter())
    }

    /// Text items rendered as strings.
    pub fn texts(&self) -> impl Iterator<Item = String> + '_ {
        self.text.iter().map(|t| match t {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// History record of one prompt from `GET /history/{prompt_id}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryEntry {
    /// Node id -> raw output, in the order the server reported them.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

impl HistoryEntry {
    /// Typed per-node outputs; malformed nodes are skipped.
    pub fn node_outputs(&self) -> impl Iterator<Item = (&str, NodeOutput)> {
        self.outputs.iter().filter_map(|(id, raw)| {
            serde_json::from_value::<NodeOutput>(raw.clone())
                .ok()
                .map(|out| (id.as_str(), out))
        })
    }
}
