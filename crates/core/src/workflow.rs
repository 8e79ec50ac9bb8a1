//! ComfyUI API-format workflow model.
//!
//! An API-format workflow is a JSON object mapping node ids to node
//! descriptors:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] }
//!   }
//! }
//! ```
//!
//! UI-format documents (the editor's save format, with top-level `nodes`
//! and `links` arrays) are rejected by [`is_api_format`] before any other
//! processing happens.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::CoreError;

/// Class-type prefix used by the service for internal composite nodes.
pub const COMPOSITE_NODE_PREFIX: &str = "workflow/";

/// A validated API-format workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    nodes: Map<String, Value>,
}

/// Borrowed view of a single workflow node.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowNode<'a> {
    pub id: &'a str,
    pub class_type: &'a str,
    pub inputs: Option<&'a Map<String, Value>>,
}

impl WorkflowNode<'_> {
    /// Whether this node is an internal composite node (`workflow/...`).
    pub fn is_composite(&self) -> bool {
        self.class_type.starts_with(COMPOSITE_NODE_PREFIX)
    }
}

/// Returns `true` when `value` is an executable API-format graph.
///
/// Every top-level entry must be an object with a string `class_type`,
/// and `inputs`, when present, must be an object. Empty objects are
/// rejected.
pub fn is_api_format(value: &Value) -> bool {
    value.as_object().is_some_and(is_api_format_map)
}

fn is_api_format_map(obj: &Map<String, Value>) -> bool {
    if obj.is_empty() {
        return false;
    }
    obj.values().all(|node| {
        let Some(node) = node.as_object() else {
            return false;
        };
        let has_class_type = node.get("class_type").is_some_and(Value::is_string);
        let inputs_ok = node.get("inputs").map_or(true, Value::is_object);
        has_class_type && inputs_ok
    })
}

impl Workflow {
    /// Wrap a parsed JSON value, rejecting anything that is not API format.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(nodes) if is_api_format_map(&nodes) => Ok(Self { nodes }),
            _ => Err(CoreError::Validation(
                "Workflow is not an API-format graph".to_string(),
            )),
        }
    }

    /// Parse an inline JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("Workflow is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Load a workflow from either a filesystem path or inline JSON.
    ///
    /// If `input` names an existing file its contents are parsed;
    /// otherwise `input` itself is parsed as JSON.
    pub async fn load(input: &str) -> Result<Self, CoreError> {
        let path = Path::new(input);
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(path).await?;
            return Self::from_json_str(&contents);
        }
        Self::from_json_str(input)
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = WorkflowNode<'_>> {
        self.nodes.iter().filter_map(|(id, node)| {
            let class_type = node.get("class_type")?.as_str()?;
            Some(WorkflowNode {
                id,
                class_type,
                inputs: node.get("inputs").and_then(Value::as_object),
            })
        })
    }

    /// Replace the value of a single node input.
    ///
    /// Returns `false` when the node or input does not exist.
    pub fn set_input(&mut self, node_id: &str, input: &str, value: Value) -> bool {
        let slot = self
            .nodes
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .and_then(|inputs| inputs.get_mut(input));
        match slot {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Read a single node input.
    pub fn input(&self, node_id: &str, input: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.get("inputs")?.get(input)
    }

    /// The graph as a JSON value, ready to submit.
    pub fn to_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow_json() -> Value {
        json!({
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": { "ckpt_name": "SD1.5/dreamshaper_8.safetensors" }
            },
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 42, "model": ["4", 0] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "filename_prefix": "out", "images": ["8", 0] }
            }
        })
    }

    // -- is_api_format -------------------------------------------------------

    #[test]
    fn api_format_accepted() {
        assert!(is_api_format(&sample_workflow_json()));
    }

    #[test]
    fn ui_format_rejected() {
        let ui = json!({
            "last_node_id": 9,
            "nodes": [{ "id": 3, "type": "KSampler" }],
            "links": []
        });
        assert!(!is_api_format(&ui));
    }

    #[test]
    fn empty_object_rejected() {
        assert!(!is_api_format(&json!({})));
    }

    #[test]
    fn non_object_rejected() {
        assert!(!is_api_format(&json!([1, 2, 3])));
    }

    #[test]
    fn node_without_class_type_rejected() {
        assert!(!is_api_format(&json!({ "1": { "inputs": {} } })));
    }

    #[test]
    fn node_with_non_object_inputs_rejected() {
        assert!(!is_api_format(
            &json!({ "1": { "class_type": "X", "inputs": [1] } })
        ));
    }

    #[test]
    fn node_without_inputs_accepted() {
        assert!(is_api_format(&json!({ "1": { "class_type": "X" } })));
    }

    // -- loading -------------------------------------------------------------

    #[test]
    fn invalid_json_is_validation_error() {
        let err = Workflow::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn load_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        tokio::fs::write(&path, sample_workflow_json().to_string())
            .await
            .unwrap();

        let wf = Workflow::load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(wf.len(), 3);
    }

    #[tokio::test]
    async fn load_falls_back_to_inline_json() {
        let wf = Workflow::load(&sample_workflow_json().to_string())
            .await
            .unwrap();
        assert_eq!(wf.len(), 3);
    }

    #[tokio::test]
    async fn load_rejects_ui_format_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ui.json");
        tokio::fs::write(&path, r#"{"nodes": [], "links": []}"#)
            .await
            .unwrap();

        assert!(Workflow::load(path.to_str().unwrap()).await.is_err());
    }

    // -- accessors -----------------------------------------------------------

    #[test]
    fn nodes_preserve_document_order() {
        let wf = Workflow::from_value(sample_workflow_json()).unwrap();
        let ids: Vec<&str> = wf.nodes().map(|n| n.id).collect();
        assert_eq!(ids, vec!["4", "3", "9"]);
    }

    #[test]
    fn set_input_replaces_value() {
        let mut wf = Workflow::from_value(sample_workflow_json()).unwrap();
        assert!(wf.set_input("4", "ckpt_name", json!("dreamshaper_8.safetensors")));
        assert_eq!(
            wf.input("4", "ckpt_name"),
            Some(&json!("dreamshaper_8.safetensors"))
        );
    }

    #[test]
    fn set_input_on_missing_node_is_noop() {
        let mut wf = Workflow::from_value(sample_workflow_json()).unwrap();
        assert!(!wf.set_input("404", "ckpt_name", json!("x")));
        assert_eq!(wf, Workflow::from_value(sample_workflow_json()).unwrap());
    }

    #[test]
    fn composite_nodes_detected() {
        let wf = Workflow::from_value(json!({
            "1": { "class_type": "workflow/upscale", "inputs": {} }
        }))
        .unwrap();
        assert!(wf.nodes().next().unwrap().is_composite());
    }
}
