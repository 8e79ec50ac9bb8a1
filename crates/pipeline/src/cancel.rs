//! Cooperative cancellation of a running job.
//!
//! Submission is asynchronous, so a job tagged with a client id may not be
//! in the running queue yet when cancellation is requested. The queue is
//! polled for a bounded window before giving up.

use std::time::Duration;

use comfyrun_comfyui::catalog::QueueState;
use comfyrun_comfyui::events::RunnerEvent;
use comfyrun_comfyui::service::ComfyService;
use tokio::sync::broadcast;

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct CancelPolicy {
    /// How long to keep looking for the tagged job.
    pub retry_window: Duration,
    /// Pause between queue polls.
    pub poll_gap: Duration,
    /// Attempts at fetching the queue before it counts as unreachable.
    pub queue_attempts: u32,
    pub queue_retry_delay: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            retry_window: Duration::from_secs(5),
            poll_gap: Duration::from_secs(2),
            queue_attempts: 12,
            queue_retry_delay: Duration::from_secs(1),
        }
    }
}

impl CancelPolicy {
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }
}

/// Interrupt the job tagged `client_id`, or whatever is running when no
/// tag is given.
///
/// Returns `Ok(false)` when the window closes without the tagged job
/// showing up as running, and [`PipelineError::QueueUnreachable`] when the
/// queue cannot be fetched at all.
pub async fn cancel_generation(
    service: &dyn ComfyService,
    client_id: Option<&str>,
    policy: &CancelPolicy,
    events: &broadcast::Sender<RunnerEvent>,
) -> Result<bool, PipelineError> {
    let Some(client_id) = client_id else {
        service.interrupt().await?;
        tracing::info!("Interrupted current generation");
        let _ = events.send(RunnerEvent::GenerationCancelled { client_id: None });
        return Ok(true);
    };

    let mut remaining = policy.retry_window;
    while !remaining.is_zero() {
        let queue = fetch_queue(service, policy)
            .await
            .ok_or(PipelineError::QueueUnreachable)?;

        let running = queue
            .queue_running
            .iter()
            .any(|item| item.client_id() == Some(client_id));
        if running {
            service.interrupt().await?;
            tracing::info!(client_id = %client_id, "Generation terminated");
            let _ = events.send(RunnerEvent::GenerationCancelled {
                client_id: Some(client_id.to_string()),
            });
            return Ok(true);
        }

        if policy.poll_gap.is_zero() {
            break;
        }
        tokio::time::sleep(policy.poll_gap).await;
        remaining = remaining.saturating_sub(policy.poll_gap);
    }

    tracing::error!(client_id = %client_id, "Generation not found, aborting cancel");
    Ok(false)
}

async fn fetch_queue(service: &dyn ComfyService, policy: &CancelPolicy) -> Option<QueueState> {
    for attempt in 1..=policy.queue_attempts.max(1) {
        match service.get_queue().await {
            Ok(queue) => return Some(queue),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Queue fetch failed");
                tokio::time::sleep(policy.queue_retry_delay).await;
            }
        }
    }
    tracing::error!("Unable to stop generation, service unreachable");
    None
}
