//! Completion wait over a ComfyUI event stream.
//!
//! Reads frames from the event socket, parses them into typed
//! [`ComfyUIMessage`] variants, emits [`RunnerEvent`]s for the prompt
//! being watched, and returns once the server reports that the prompt
//! finished: an `executing` message with a null node for that prompt id.
//!
//! The wait is bounded by a timeout and can be interrupted through a
//! [`CancellationToken`].

use std::ops::ControlFlow;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::events::RunnerEvent;
use crate::messages::{parse_message, ComfyUIMessage, ExecutingData};
use crate::service::EventStream;

/// Why a completion wait ended without the prompt finishing.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Timed out after {0:?} waiting for the prompt to finish")]
    Timeout(Duration),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Event stream closed before the prompt finished")]
    StreamClosed,

    #[error("Event stream error: {0}")]
    Stream(#[from] tungstenite::Error),

    #[error("Node {node_id} ({node_type}) failed: {exception_type}: {message}")]
    Execution {
        node_id: String,
        node_type: String,
        exception_type: String,
        message: String,
    },

    #[error("Execution interrupted")]
    Interrupted,
}

/// Block until `prompt_id` finishes, fails, or the wait is abandoned.
///
/// Binary frames (preview images) are skipped. Messages that fail to
/// parse are logged and skipped.
pub async fn wait_for_completion(
    stream: &mut EventStream,
    prompt_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    event_tx: &broadcast::Sender<RunnerEvent>,
) -> Result<(), WaitError> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(prompt_id = %prompt_id, "Completion wait cancelled");
                return Err(WaitError::Cancelled);
            }
            _ = &mut deadline => {
                tracing::error!(prompt_id = %prompt_id, ?timeout, "Completion wait timed out");
                return Err(WaitError::Timeout(timeout));
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let ControlFlow::Break(outcome) = handle_text_message(&text, prompt_id, event_tx) {
                        return outcome;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!(prompt_id = %prompt_id, "Ignoring binary message (preview image)");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::warn!(prompt_id = %prompt_id, ?frame, "ComfyUI WebSocket closed");
                    return Err(WaitError::StreamClosed);
                }
                Some(Err(e)) => {
                    tracing::error!(prompt_id = %prompt_id, error = %e, "WebSocket receive error");
                    return Err(WaitError::Stream(e));
                }
                None => return Err(WaitError::StreamClosed),
            }
        }
    }
}

/// Interpret one text frame. `Break` ends the wait with the given outcome.
fn handle_text_message(
    text: &str,
    prompt_id: &str,
    event_tx: &broadcast::Sender<RunnerEvent>,
) -> ControlFlow<Result<(), WaitError>> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
            return ControlFlow::Continue(());
        }
    };

    // Progress frames from older servers carry no prompt id.
    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        return ControlFlow::Continue(());
    }

    match msg {
        ComfyUIMessage::Executing(ExecutingData { node: Some(node), .. }) => {
            tracing::debug!(prompt_id = %prompt_id, node = %node, "Executing node");
            ControlFlow::Continue(())
        }
        ComfyUIMessage::Executing(ExecutingData { node: None, .. }) => {
            tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
            let _ = event_tx.send(RunnerEvent::GenerationCompleted {
                prompt_id: prompt_id.to_string(),
            });
            ControlFlow::Break(Ok(()))
        }
        ComfyUIMessage::Progress(data) => {
            let percent = data.percent();
            tracing::debug!(prompt_id = %prompt_id, value = data.value, max = data.max, percent, "Generation progress");
            let _ = event_tx.send(RunnerEvent::GenerationProgress {
                prompt_id: prompt_id.to_string(),
                percent,
                current_node: data.node,
            });
            ControlFlow::Continue(())
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            let _ = event_tx.send(RunnerEvent::GenerationError {
                prompt_id: prompt_id.to_string(),
                error: data.exception_message.clone(),
            });
            ControlFlow::Break(Err(WaitError::Execution {
                node_id: data.node_id,
                node_type: data.node_type,
                exception_type: data.exception_type,
                message: data.exception_message,
            }))
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::warn!(prompt_id = %prompt_id, node_id = ?data.node_id, "Execution interrupted");
            ControlFlow::Break(Err(WaitError::Interrupted))
        }
        ComfyUIMessage::ExecutionStart(_) => {
            tracing::info!(prompt_id = %prompt_id, "Execution started");
            ControlFlow::Continue(())
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %prompt_id, nodes = ?data.nodes, "Cached nodes skipped");
            ControlFlow::Continue(())
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id = %prompt_id, node = %data.node, "Node executed with output");
            ControlFlow::Continue(())
        }
        ComfyUIMessage::Status { queue_remaining } => {
            tracing::debug!(queue_remaining = ?queue_remaining, "ComfyUI queue status");
            ControlFlow::Continue(())
        }
        ComfyUIMessage::ExecutionSuccess(_) => ControlFlow::Continue(()),
        ComfyUIMessage::Other(kind) => {
            tracing::trace!(kind = %kind, "Ignoring message kind");
            ControlFlow::Continue(())
        }
    }
}
