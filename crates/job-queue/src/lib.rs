//! Queue contract and clients for the pending-evaluation and pending-score
//! queues.
//!
//! Delivery is at-least-once: duplicates are expected and absorbed further
//! down by the store's create-only writes and the dispatch loop's existence
//! probe. A held message is kept invisible by a background visibility
//! extender until it is acknowledged or the worker dies.

pub mod memory;
pub mod sqs;

pub use memory::MemoryQueue;
pub use sqs::SqsQueue;

use async_trait::async_trait;
use serde::Deserialize;

/// A dequeued job: one (match, participant, trial) to evaluate or score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    pub match_id: String,
    pub participant_id: String,
    /// Sort-key form of the trial: the bare zero-padded number for the
    /// evaluator, `Success#<n>` for the scorer (which reads the evaluation
    /// series directly with it).
    pub trial: String,
    pub trial_no: String,
}

/// How a queue's messages map onto sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Evaluator,
    Scorer,
}

/// The wire form of a queue message body.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageBody {
    #[serde(rename = "MatchID")]
    pub match_id: String,
    #[serde(rename = "ParticipantID")]
    pub participant_id: String,
    #[serde(rename = "TrialNo")]
    pub trial_no: String,
}

impl QueueMode {
    pub(crate) fn normalize(self, body: MessageBody) -> JobMessage {
        let trial = match self {
            QueueMode::Evaluator => body.trial_no.clone(),
            QueueMode::Scorer => format!("Success#{}", body.trial_no),
        };
        JobMessage {
            match_id: body.match_id,
            participant_id: body.participant_id,
            trial,
            trial_no: body.trial_no,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue request failed")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("malformed message body: {0}")]
    Malformed(String),
    #[error("no message held")]
    NoMessage,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Validate the queue endpoint and credentials at startup.
    async fn check_accessible(&self) -> Result<(), QueueError>;

    /// Block until a message is visible and return it. The message stays
    /// invisible to other consumers until deleted or its visibility lapses.
    async fn get_message(&self) -> Result<JobMessage, QueueError>;

    /// Acknowledge the currently held message.
    async fn delete_message(&self) -> Result<(), QueueError>;

    /// Start the background task keeping the held message invisible while
    /// work is in flight. Clients without visibility semantics ignore this.
    fn wake_up_visibility_extender(&self) {}
}
