//! The scorer dispatch loop: receive a successfully evaluated trial, run the
//! match's indicator container over the current evaluation plus the
//! participant's history, persist the score, acknowledge, and extend the
//! local history cache.

use crate::cache::{Cache, Trial};
use crate::history;
use crate::shutdown::{self, Interrupted};
use crate::util::{self, MAX_ERROR_MESSAGE_LENGTH};
use crate::worker::{self, Deps, Stamps, WorkerOptions};
use anyhow::Context;
use docker_executor::RunConfig;
use job_queue::JobMessage;
use match_client::Match;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trial_store::evaluation::fetch_success_evaluation_by_primary_key;
use trial_store::score::{
    is_score_exists, save_failed_score, save_success_score, FailedScoreInput, SuccessScoreInput,
};
use trial_store::zfill::zfill;

pub async fn run(
    options: &WorkerOptions,
    deps: &Deps,
    cache: &mut Cache,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    deps.queue
        .check_accessible()
        .await
        .context("the score queue is not accessible")?;
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
        tracing::info!(iteration, "looking for an evaluation to score");

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

        let exists = shutdown::guard(
            cancel,
            is_score_exists(
                deps.store.as_ref(),
                &matched.id,
                &message.participant_id,
                &message.trial_no,
            ),
        )
        .await;
        match exists {
            Ok(true) => {
                tracing::warn!(trial_no = %message.trial_no, "the score already exists");
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
                    "failed to probe for an existing score"
                );
                continue;
            }
        }

        let mut stamps = Stamps::default();
        if let Err(err) =
            score_one(options, deps, cache, cancel, &message, &matched, &mut stamps).await
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

async fn score_one(
    options: &WorkerOptions,
    deps: &Deps,
    cache: &mut Cache,
    cancel: &CancellationToken,
    message: &JobMessage,
    matched: &Match,
    stamps: &mut Stamps,
) -> anyhow::Result<()> {
    let evaluation = shutdown::guard(
        cancel,
        fetch_success_evaluation_by_primary_key(
            deps.store.as_ref(),
            &matched.id,
            &message.participant_id,
            &message.trial_no,
        ),
    )
    .await?;
    tracing::debug!(trial_no = %evaluation.trial_no, "fetched evaluation");

    let current = serde_json::json!({
        "objective": evaluation.objective,
        "constraint": evaluation.constraint,
        "info": evaluation.info,
        "feasible": evaluation.feasible,
    });

    // History up to, and excluding, the trial being scored.
    let trial_no: u64 = evaluation
        .trial_no
        .parse()
        .context("the evaluation's trial number is not numeric")?;
    anyhow::ensure!(trial_no >= 1, "trial numbers start at 1");
    let up_to = zfill(trial_no - 1, evaluation.trial_no.len())?;
    let history = shutdown::guard(
        cancel,
        history::make_history(
            &matched.id,
            &evaluation.participant_id,
            &up_to,
            cache,
            deps.store.as_ref(),
        ),
    )
    .await?;
    tracing::debug!(trials = history.len(), "assembled history");

    let stdin = [
        serde_json::to_string(&current).context("encoding the current evaluation")? + "\n",
        serde_json::to_string(&history).context("encoding the history")? + "\n",
    ];

    stamps.started_at = Some(util::now_utc());
    tracing::info!(
        image = %matched.indicator_image,
        started_at = stamps.started_at.as_deref(),
        "calculating score"
    );
    let run = RunConfig {
        image: matched.indicator_image.clone(),
        environments: matched.indicator_environments.clone(),
        command: options.command.clone(),
        timeout: Duration::from_secs(options.timeout),
        remove: options.rm,
    };
    let output = shutdown::guard(cancel, deps.containers.run(&run, &stdin)).await?;
    stamps.finished_at = Some(util::now_utc());
    tracing::info!(finished_at = stamps.finished_at.as_deref(), "score calculated");

    let score = match output.get("score") {
        Some(score) if !score.is_null() => score.clone(),
        _ => anyhow::bail!("the indicator output has no score"),
    };
    anyhow::ensure!(score.is_number(), "the indicator score is not numeric: {score}");

    let input = SuccessScoreInput {
        match_id: matched.id.clone(),
        participant_id: message.participant_id.clone(),
        trial_no: message.trial_no.clone(),
        created_at: util::now_utc(),
        started_at: stamps.started_at.clone().unwrap_or_else(util::now_utc),
        finished_at: stamps.finished_at.clone().unwrap_or_else(util::now_utc),
        score: score.clone(),
    };
    shutdown::guard(cancel, save_success_score(deps.store.as_ref(), &input)).await?;
    tracing::info!(trial_no = %message.trial_no, "saved score");

    shutdown::guard(cancel, deps.queue.delete_message()).await?;

    // The cache is an accelerator only; a write failure must not fail a
    // trial that is already durably scored and acknowledged.
    let trial = Trial {
        trial_no: evaluation.trial_no.clone(),
        objective: evaluation.objective.clone(),
        constraint: evaluation.constraint.clone(),
        info: evaluation.info.clone(),
        score,
        feasible: evaluation.feasible,
    };
    if let Err(err) = history::write_to_cache(cache, &matched.id, &evaluation.participant_id, trial)
    {
        tracing::warn!(error = %err, "failed to write the scored trial to the cache");
    }
    Ok(())
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
        "failed to calculate the score"
    );

    let input = FailedScoreInput {
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
    if let Err(save_err) = save_failed_score(deps.store.as_ref(), &input).await {
        tracing::error!(
            ?save_err,
            "failed to save the failed score"
        );
        return;
    }
    if let Err(delete_err) = deps.queue.delete_message().await {
        tracing::error!(
            error = %delete_err,
            "failed to delete the message of a failed score"
        );
    }
}
