//! Control plane around a ComfyUI server.
//!
//! Manages the service process and its checkout, resolves a workflow's
//! custom-node and model dependencies, runs the workflow and collects
//! its outputs. [`pipeline::ExecutionPipeline`] ties the pieces together;
//! every external collaborator sits behind a trait so it can be swapped
//! out in tests.

pub mod bootstrap;
pub mod cancel;
pub mod command;
pub mod config;
pub mod downloader;
pub mod error;
pub mod harvest;
pub mod model_resolver;
pub mod node_installer;
pub mod nodes;
pub mod pipeline;
pub mod process;

pub use config::RunnerConfig;
pub use error::PipelineError;
pub use harvest::{OutputTagging, RunResult};
pub use pipeline::{ExecutionPipeline, InputFile, PipelineParts, PostRunAction, RunOptions};
