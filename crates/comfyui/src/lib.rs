//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! HTTP API wrappers, reconnection logic, the completion-wait loop and
//! the runner event types used to drive a single ComfyUI server.

pub mod api;
pub mod catalog;
pub mod client;
pub mod events;
pub mod messages;
pub mod processor;
pub mod reconnect;
pub mod service;
