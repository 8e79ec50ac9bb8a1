//! Runner events broadcast while a workflow is prepared and executed.
//!
//! These represent the state changes a caller cares about: the server
//! process coming and going, dependencies being installed, and the
//! lifecycle of the submitted prompt. They are sent on a
//! [`tokio::sync::broadcast`] channel; having no subscribers is fine.

use serde::Serialize;

/// Broadcast channel capacity for runner events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A runner-level event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// The ComfyUI process was spawned and answers requests.
    ServerStarted { port: u16 },

    /// The ComfyUI process was terminated.
    ServerStopped { port: u16 },

    /// A custom node was installed (or an install was attempted and succeeded).
    NodeInstalled { source: String },

    /// A custom node install failed; the run may continue.
    NodeInstallFailed { source: String, error: String },

    /// A model file was fetched into the model tree.
    ModelDownloaded { model: String },

    /// A model could not be found or fetched.
    ModelMissing {
        model: String,
        similar_models: Vec<String>,
    },

    /// A prompt was accepted by the server.
    GenerationQueued { prompt_id: String, client_id: String },

    /// A generation job made progress (step N of M).
    GenerationProgress {
        prompt_id: String,
        /// Completion percentage (0-100) of the current node.
        percent: i16,
        /// The node currently executing, if known.
        current_node: Option<String>,
    },

    /// A generation job completed successfully.
    GenerationCompleted { prompt_id: String },

    /// A generation job failed with an error.
    GenerationError {
        prompt_id: String,
        /// Human-readable error description.
        error: String,
    },

    /// A running generation was interrupted on request.
    GenerationCancelled { client_id: Option<String> },
}
