//! The evaluator dispatch loop: receive a pending trial, run the match's
//! problem container over the submitted solution, persist the evaluation,
//! acknowledge.

use crate::shutdown::{self, Interrupted};
use crate::util::{self, MAX_ERROR_MESSAGE_LENGTH};
use crate::worker::{self, Deps, Stamps, WorkerOptions};
use anyhow::Context;
use docker_executor::RunConfig;
use job_queue::JobMessage;
use match_client::Match;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trial_store::evaluation::{
    is_evaluation_exists, save_failed_evaluation, save_success_evaluation, FailedEvaluationInput,
    SuccessEvaluationInput,
};
use trial_store::solution::fetch_solution_by_primary_key;

pub async fn run(
    options: &WorkerOptions,
    deps: &Deps,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    deps.queue
        .check_accessible()
        .await
        .context("the evaluation queue is not accessible")?;
    deps.store
        .check_accessible()
        .await
        .context("the store is not accessible")?;
    deps.queue.wake_up_visibility_extender();

    let mut iteration = 0u64;
    let mut handled = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(Interrupted.into());
        }
        iteration += 1;
        tracing::info!(iteration, "looking for a solution to evaluate");

        let message = match shutdown::guard(cancel, deps.queue.get_message()).await {
            Ok(message) => message,
            Err(err) if shutdown::is_interrupted(&err) => return Err(err),
            Err(err) => {
                tracing::warn!(?err, "failed to receive a message");
                continue;
            }
        };
        tracing::debug!(?message, "received message");

        let matched =
            match shutdown::guard(cancel, deps.matches.fetch_match_by_id(&message.match_id)).await
            {
                Ok(matched) => matched,
                Err(err) if shutdown::is_interrupted(&err) => return Err(err),
                Err(err) if worker::is_fatal_match_error(&err) => {
                    tracing::error!(
                        ?err,
                        match_id = %message.match_id,
                        "cannot access the match's docker images"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        match_id = %message.match_id,
                        "failed to resolve the match"
                    );
                    continue;
                }
            };

        // A record persisted by an earlier delivery makes this a duplicate:
        // acknowledge and move on without running anything.
        let exists = shutdown::guard(
            cancel,
            is_evaluation_exists(
                deps.store.as_ref(),
                &matched.id,
                &message.participant_id,
                &message.trial_no,
            ),
        )
        .await;
        match exists {
            Ok(true) => {
                tracing::warn!(trial_no = %message.trial_no, "the evaluation already exists");
                if let Err(err) = deps.queue.delete_message().await {
                    tracing::warn!(error = %err, "failed to delete the duplicate message");
                }
                handled += 1;
                if worker::reached_limit(options, handled) {
                    return Ok(());
                }
                continue;
            }
            Ok(false) => {}
            Err(err) if shutdown::is_interrupted(&err) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    ?err,
                    "failed to probe for an existing evaluation"
                );
                continue;
            }
        }

        let mut stamps = Stamps::default();
        if let Err(err) = evaluate_one(options, deps, cancel, &message, &matched, &mut stamps).await
        {
            persist_failure(deps, &message, &matched, &stamps, &err).await;
            if shutdown::is_interrupted(&err) {
                return Err(err);
            }
        }
        handled += 1;
        if worker::reached_limit(options, handled) {
            return Ok(());
        }
    }
}

async fn evaluate_one(
    options: &WorkerOptions,
    deps: &Deps,
    cancel: &CancellationToken,
    message: &JobMessage,
    matched: &Match,
    stamps: &mut Stamps,
) -> anyhow::Result<()> {
    let solution = shutdown::guard(
        cancel,
        fetch_solution_by_primary_key(
            deps.store.as_ref(),
            &matched.id,
            &message.participant_id,
            &message.trial,
        ),
    )
    .await?;
    tracing::debug!(variable = %solution.variable, "fetched solution");

    let stdin = serde_json::to_string(&solution.variable)
        .context("encoding the solution variable")?
        + "\n";

    stamps.started_at = Some(util::now_utc());
    tracing::info!(
        image = %matched.problem_image,
        started_at = stamps.started_at.as_deref(),
        "evaluating solution"
    );
    let run = RunConfig {
        image: matched.problem_image.clone(),
        environments: matched.problem_environments.clone(),
        command: options.command.clone(),
        timeout: Duration::from_secs(options.timeout),
        remove: options.rm,
    };
    let output = shutdown::guard(cancel, deps.containers.run(&run, &[stdin])).await?;
    stamps.finished_at = Some(util::now_utc());
    tracing::info!(finished_at = stamps.finished_at.as_deref(), "evaluation finished");

    let (objective, constraint, info, feasible) = split_output(output)?;

    let input = SuccessEvaluationInput {
        match_id: matched.id.clone(),
        participant_id: message.participant_id.clone(),
        trial_no: message.trial_no.clone(),
        created_at: util::now_utc(),
        started_at: stamps.started_at.clone().unwrap_or_else(util::now_utc),
        finished_at: stamps.finished_at.clone().unwrap_or_else(util::now_utc),
        objective,
        constraint,
        info,
        feasible,
    };
    shutdown::guard(cancel, save_success_evaluation(deps.store.as_ref(), &input)).await?;
    tracing::info!(trial_no = %message.trial_no, "saved evaluation");

    shutdown::guard(cancel, deps.queue.delete_message()).await?;
    Ok(())
}

/// Pull the required and optional fields out of the problem container's
/// output, defaulting the optional ones.
fn split_output(output: Value) -> anyhow::Result<(Value, Value, Value, Option<bool>)> {
    let Value::Object(mut fields) = output else {
        anyhow::bail!("the container output is not a JSON object");
    };
    let objective = fields
        .remove("objective")
        .ok_or_else(|| anyhow::anyhow!("the container output has no objective"))?;
    let constraint = fields.remove("constraint").unwrap_or(Value::Null);
    let info = fields
        .remove("info")
        .unwrap_or_else(|| Value::Object(Default::default()));
    let feasible = match fields.remove("feasible") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(feasible)) => Some(feasible),
        Some(other) => anyhow::bail!("feasible must be a boolean or null, got {other}"),
    };
    Ok((objective, constraint, info, feasible))
}

/// The failure path: stamp whatever is missing, persist a failed record, and
/// acknowledge so the message is not redelivered. Runs regardless of
/// cancellation.
async fn persist_failure(
    deps: &Deps,
    message: &JobMessage,
    matched: &Match,
    stamps: &Stamps,
    err: &anyhow::Error,
) {
    tracing::error!(
        ?err,
        trial_no = %message.trial_no,
        "failed to evaluate the solution"
    );

    let input = FailedEvaluationInput {
        match_id: matched.id.clone(),
        participant_id: message.participant_id.clone(),
        trial_no: message.trial_no.clone(),
        created_at: util::now_utc(),
        started_at: stamps.started_at.clone().unwrap_or_else(util::now_utc),
        finished_at: stamps.finished_at.clone().unwrap_or_else(util::now_utc),
        error_message: util::truncate_text_center(
            &worker::participant_error_message(err),
            MAX_ERROR_MESSAGE_LENGTH,
        ),
        admin_error_message: util::truncate_text_center(
            &worker::admin_error_message(err),
            MAX_ERROR_MESSAGE_LENGTH,
        ),
    };
    if let Err(save_err) = save_failed_evaluation(deps.store.as_ref(), &input).await {
        tracing::error!(
            ?save_err,
            "failed to save the failed evaluation"
        );
        return;
    }
    if let Err(delete_err) = deps.queue.delete_message().await {
        tracing::error!(
            error = %delete_err,
            "failed to delete the message of a failed evaluation"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_fields_default() {
        let (objective, constraint, info, feasible) =
            split_output(json!({"objective": [1.0, 2.0]})).unwrap();
        assert_eq!(objective, json!([1.0, 2.0]));
        assert_eq!(constraint, Value::Null);
        assert_eq!(info, json!({}));
        assert_eq!(feasible, None);
    }

    #[test]
    fn provided_fields_pass_through() {
        let (objective, constraint, info, feasible) = split_output(json!({
            "objective": 0.5,
            "constraint": [-1.0],
            "info": {"steps": 12},
            "feasible": true,
        }))
        .unwrap();
        assert_eq!(objective, json!(0.5));
        assert_eq!(constraint, json!([-1.0]));
        assert_eq!(info, json!({"steps": 12}));
        assert_eq!(feasible, Some(true));
    }

    #[test]
    fn missing_objective_is_an_error() {
        assert!(split_output(json!({"constraint": null})).is_err());
        assert!(split_output(json!(["not", "an", "object"])).is_err());
    }
}
