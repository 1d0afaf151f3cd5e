//! Pieces shared by the evaluator and scorer dispatch loops.

use docker_executor::{ContainerRunner, ExecError};
use job_queue::JobQueue;
use match_client::{MatchError, MatchResolver};
use std::sync::Arc;
use trial_store::Store;

/// Settled per-worker options, derived from configuration and the CLI.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name under which the stop flag of this worker is filed.
    pub process_name: String,
    /// Per-container wall-clock budget in seconds.
    pub timeout: u64,
    /// Optional bound on handled messages.
    pub num: Option<u64>,
    /// Remove containers after they exit.
    pub rm: bool,
    /// Argv passed through to the containers.
    pub command: Vec<String>,
}

/// The four service seams a dispatch loop runs against.
#[derive(Clone)]
pub struct Deps {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn Store>,
    pub matches: Arc<dyn MatchResolver>,
    pub containers: Arc<dyn ContainerRunner>,
}

/// Timestamps taken around the container run. A failure that happened before
/// or during the run stamps its record with "now" for whichever is missing.
#[derive(Debug, Default)]
pub struct Stamps {
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// The participant-visible failure text. Errors the container itself
/// reported are actionable for its author and surface verbatim; everything
/// else is opaque to participants.
pub fn participant_error_message(err: &anyhow::Error) -> String {
    let container_error = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<ExecError>(), Some(ExecError::Runtime(_))));
    if container_error {
        format!("{err:#}")
    } else {
        "Internal Server Error".to_string()
    }
}

/// The operator-visible failure text: the full error chain.
pub fn admin_error_message(err: &anyhow::Error) -> String {
    format!("{err:?}")
}

/// True when the resolver error means this worker is not authorized for the
/// match's images, which no retry will fix.
pub fn is_fatal_match_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MatchError>(),
        Some(MatchError::ImageNotFound(_))
    )
}

/// Whether the optional job limit has been reached.
pub(crate) fn reached_limit(options: &WorkerOptions, handled: u64) -> bool {
    match options.num {
        Some(num) if handled >= num => {
            tracing::info!(handled, "job limit reached");
            true
        }
        _ => false,
    }
}
