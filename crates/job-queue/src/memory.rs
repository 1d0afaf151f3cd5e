//! An in-memory queue for dispatch-loop tests. Duplicate deliveries are
//! passed through verbatim, which is exactly what at-least-once tests need.

use crate::{JobMessage, JobQueue, MessageBody, QueueError, QueueMode};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MemoryQueue {
    mode: QueueMode,
    pending: Mutex<VecDeque<String>>,
    held: Mutex<Option<String>>,
    acknowledged: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            held: Mutex::new(None),
            acknowledged: AtomicUsize::new(0),
        }
    }

    /// Enqueue a raw message body.
    pub fn push_body(&self, body: impl Into<String>) {
        self.pending.lock().unwrap().push_back(body.into());
    }

    /// Enqueue a well-formed message.
    pub fn push(&self, match_id: &str, participant_id: &str, trial_no: &str) {
        self.push_body(
            serde_json::json!({
                "MatchID": match_id,
                "ParticipantID": participant_id,
                "TrialNo": trial_no,
            })
            .to_string(),
        );
    }

    /// Messages acknowledged so far.
    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn check_accessible(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn get_message(&self) -> Result<JobMessage, QueueError> {
        loop {
            let next = self.pending.lock().unwrap().pop_front();
            if let Some(body) = next {
                *self.held.lock().unwrap() = Some(body.clone());
                let body: MessageBody = serde_json::from_str(&body)
                    .map_err(|err| QueueError::Malformed(err.to_string()))?;
                return Ok(self.mode.normalize(body));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn delete_message(&self) -> Result<(), QueueError> {
        if self.held.lock().unwrap().take().is_none() {
            return Err(QueueError::NoMessage);
        }
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn delivers_and_acknowledges_in_order() {
        let queue = MemoryQueue::new(QueueMode::Evaluator);
        queue.push("M1", "P1", "00001");
        queue.push("M1", "P1", "00002");

        let first = queue.get_message().await.unwrap();
        assert_eq!(first.trial_no, "00001");
        queue.delete_message().await.unwrap();

        let second = queue.get_message().await.unwrap();
        assert_eq!(second.trial_no, "00002");
        queue.delete_message().await.unwrap();

        assert_eq!(queue.acknowledged(), 2);
    }

    #[tokio::test]
    async fn delete_without_a_held_message_fails() {
        let queue = MemoryQueue::new(QueueMode::Evaluator);
        assert!(matches!(
            queue.delete_message().await,
            Err(QueueError::NoMessage)
        ));
    }
}
