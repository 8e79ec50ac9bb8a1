//! Pure domain logic for the ComfyUI runner.
//!
//! Workflow parsing and validation, model-reference extraction and
//! candidate selection, and the small filesystem helpers the pipeline
//! uses to stage inputs and harvest outputs. Nothing in this crate
//! talks to the network.

pub mod error;
pub mod files;
pub mod hashing;
pub mod model_refs;
pub mod similarity;
pub mod workflow;
