//! Retrying the event-stream connect.
//!
//! A server that was just (re)started can answer HTTP a moment before its
//! socket endpoint accepts connections, so [`connect_with_retry`] keeps
//! trying with growing pauses until a stream opens, the attempts run out
//! or the [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::service::{EventConnector, EventStream};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause after the first failed attempt.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied to the pause after each failure.
    pub multiplier: f64,
    /// Connect attempts in total, including the first.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            max_attempts: 6,
        }
    }
}

impl ReconnectConfig {
    /// Pauses between attempts, capped at `max_delay`. Endless.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            multiplier: self.multiplier.max(1.0),
        }
    }
}

/// Iterator over growing retry pauses.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.mul_f64(self.multiplier).min(self.max);
        Some(current)
    }
}

/// Open the event stream for `client_id`.
///
/// `None` once every attempt failed or `cancel` fired.
pub async fn connect_with_retry(
    connector: &dyn EventConnector,
    client_id: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<EventStream> {
    let attempts = config.max_attempts.max(1);
    let mut pauses = config.backoff();

    for attempt in 1..=attempts {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id = %client_id, "Event stream connect cancelled");
                return None;
            }
            result = connector.connect(client_id) => result,
        };

        let error = match result {
            Ok(stream) => {
                if attempt > 1 {
                    tracing::info!(client_id = %client_id, attempt, "Event stream connected after retry");
                }
                return Some(stream);
            }
            Err(e) => e,
        };

        if attempt == attempts {
            tracing::warn!(client_id = %client_id, attempt, error = %error, "Event stream connect failed");
            break;
        }

        let pause = pauses.next().unwrap_or(config.max_delay);
        tracing::warn!(
            client_id = %client_id,
            attempt,
            error = %error,
            retry_in_ms = pause.as_millis() as u64,
            "Event stream connect failed",
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    tracing::error!(client_id = %client_id, attempts, "Giving up on the event stream");
    None
}
