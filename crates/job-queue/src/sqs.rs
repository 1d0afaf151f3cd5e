//! The SQS-backed queue client and its visibility extender.

use crate::{JobMessage, JobQueue, MessageBody, QueueError, QueueMode};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Initial invisibility window of a received message, in seconds.
const INITIAL_VISIBILITY_TIMEOUT: i32 = 8;
/// The extender renews once the remaining window shrinks to this margin.
const EXTEND_MARGIN: i32 = 4;
/// Cadence of the extender's re-evaluation.
const EXTENDER_TICK: Duration = Duration::from_secs(1);
/// Long-poll wait of a single receive call, in seconds.
const RECEIVE_WAIT: i32 = 10;

/// The message currently held by this worker. Written only by the consuming
/// loop; the extender takes snapshots and never mutates it.
#[derive(Debug, Clone)]
struct InFlight {
    receipt_handle: String,
    received_at: Instant,
}

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    mode: QueueMode,
    /// Pause between empty polls.
    interval: Duration,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl SqsQueue {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        mode: QueueMode,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            mode,
            interval,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn check_accessible(&self) -> Result<(), QueueError> {
        self.client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(0)
            .visibility_timeout(1)
            .send()
            .await
            .map_err(|err| QueueError::Unavailable(Box::new(err)))?;
        Ok(())
    }

    async fn get_message(&self) -> Result<JobMessage, QueueError> {
        loop {
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(1)
                .wait_time_seconds(RECEIVE_WAIT)
                .visibility_timeout(INITIAL_VISIBILITY_TIMEOUT)
                .send()
                .await
                .map_err(|err| QueueError::Unavailable(Box::new(err)))?;

            if let Some(message) = output.messages().first() {
                let receipt_handle = message
                    .receipt_handle()
                    .ok_or_else(|| {
                        QueueError::Malformed("message has no receipt handle".to_string())
                    })?
                    .to_string();
                *self.in_flight.lock().unwrap() = Some(InFlight {
                    receipt_handle,
                    received_at: Instant::now(),
                });

                let body: MessageBody = serde_json::from_str(message.body().unwrap_or_default())
                    .map_err(|err| QueueError::Malformed(err.to_string()))?;
                return Ok(self.mode.normalize(body));
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn delete_message(&self) -> Result<(), QueueError> {
        let receipt_handle = match &*self.in_flight.lock().unwrap() {
            Some(in_flight) => in_flight.receipt_handle.clone(),
            None => return Err(QueueError::NoMessage),
        };
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| QueueError::Unavailable(Box::new(err)))?;
        *self.in_flight.lock().unwrap() = None;
        Ok(())
    }

    fn wake_up_visibility_extender(&self) {
        let client = self.client.clone();
        let queue_url = self.queue_url.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(extend_visibility(client, queue_url, in_flight));
    }
}

/// Doubles the visibility timeout of the held message (8 → 16 → 32 → …) so
/// it is not redelivered while its container is still running. Never aborts
/// the worker: broker errors, including losing the delete race against the
/// main loop, are logged and the next tick re-evaluates.
async fn extend_visibility(
    client: aws_sdk_sqs::Client,
    queue_url: String,
    in_flight: Arc<Mutex<Option<InFlight>>>,
) {
    let mut current_timeout = INITIAL_VISIBILITY_TIMEOUT;
    loop {
        tokio::time::sleep(EXTENDER_TICK).await;

        let Some(held) = in_flight.lock().unwrap().clone() else {
            current_timeout = INITIAL_VISIBILITY_TIMEOUT;
            continue;
        };
        if !needs_extension(held.received_at.elapsed(), current_timeout) {
            continue;
        }

        let result = client
            .change_message_visibility()
            .queue_url(&queue_url)
            .receipt_handle(held.receipt_handle.clone())
            .visibility_timeout(current_timeout * 2)
            .send()
            .await;
        match result {
            Ok(_) => {
                current_timeout *= 2;
                tracing::debug!(
                    visibility_timeout = current_timeout,
                    "extended message visibility"
                );
            }
            Err(err) => {
                if in_flight.lock().unwrap().is_none() {
                    tracing::debug!("message was deleted while its visibility was being extended");
                } else {
                    tracing::warn!(error = %err, "failed to extend message visibility");
                }
            }
        }
    }
}

/// Whether the remaining visibility window has shrunk to the renewal margin.
fn needs_extension(elapsed: Duration, current_timeout: i32) -> bool {
    elapsed >= Duration::from_secs((current_timeout - EXTEND_MARGIN).max(0) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_fires_at_the_margin() {
        assert!(!needs_extension(Duration::from_secs(3), 8));
        assert!(needs_extension(Duration::from_secs(4), 8));

        // After one doubling the window is 16s and renewal moves out too.
        assert!(!needs_extension(Duration::from_secs(11), 16));
        assert!(needs_extension(Duration::from_secs(12), 16));
    }
}
