//! Assembly of a participant's scored-trial history.
//!
//! The on-disk cache supplies the prefix; the store fills the suffix with two
//! projected range queries over the `Success#` series, merged by trial
//! number. Ordering is total because trial numbers are zero-padded to one
//! width.

use crate::cache::{Cache, CacheError, Trial};
use anyhow::Context;
use trial_store::convert::decimal_to_float;
use trial_store::schema::{optional_bool_field, string_field};
use trial_store::zfill::zfill;
use trial_store::{Attr, Store};

/// A score record exists without its matching evaluation, which breaks the
/// schema's success-implies-evaluation rule.
#[derive(Debug, thiserror::Error)]
#[error("score and evaluation series do not match at trial {trial_no}")]
pub struct HistoryInconsistency {
    pub trial_no: String,
}

/// The participant's completed scored trials with trial number in
/// `[1, trial_no]`, ascending.
pub async fn make_history(
    match_id: &str,
    participant_id: &str,
    trial_no: &str,
    cache: &mut Cache,
    store: &dyn Store,
) -> anyhow::Result<Vec<Trial>> {
    load_up_to(match_id, participant_id, trial_no, cache, store).await?;

    let mut history = Vec::new();
    for trial in cache.values()? {
        if trial.trial_no.as_str() > trial_no {
            break;
        }
        history.push(trial.clone());
    }
    Ok(history)
}

async fn load_up_to(
    match_id: &str,
    participant_id: &str,
    trial_no: &str,
    cache: &mut Cache,
    store: &dyn Store,
) -> anyhow::Result<()> {
    cache.load(&format!("{match_id}#{participant_id}"))?;
    let loaded_trial_no = cache.values()?.last().map(|trial| trial.trial_no.clone());

    if let Some(loaded) = &loaded_trial_no {
        if loaded.as_str() >= trial_no {
            return Ok(());
        }
    }

    // Sort key of the first trial still missing from the cache; with nothing
    // cached, the bare tag scans the success series from its start.
    let lo = match &loaded_trial_no {
        Some(loaded) => {
            let next = loaded
                .parse::<u64>()
                .context("cached trial number is not numeric")?
                + 1;
            format!("Success#{}", zfill(next, loaded.len())?)
        }
        None => "Success#".to_string(),
    };
    let hi = format!(
        "Success#{}",
        zfill(
            trial_no.parse::<u64>().context("trial number is not numeric")?,
            trial_no.len(),
        )?
    );

    let evaluations = store
        .query_range(
            &format!("Evaluations#{match_id}#{participant_id}"),
            &lo,
            &hi,
            &["Objective", "Constraint", "Info", "Feasible", "TrialNo"],
        )
        .await?;
    let scores = store
        .query_range(
            &format!("Scores#{match_id}#{participant_id}"),
            &lo,
            &hi,
            &["TrialNo", "Value"],
        )
        .await?;

    // Merge by trial number. An evaluation without a score is simply not yet
    // scored and is skipped; a score without its evaluation is a broken
    // series.
    let mut evaluation_index = 0;
    for score in &scores {
        let score_trial_no = string_field(score, "TrialNo")?;
        while evaluation_index < evaluations.len()
            && string_field(&evaluations[evaluation_index], "TrialNo")? < score_trial_no
        {
            evaluation_index += 1;
        }
        let Some(evaluation) = evaluations.get(evaluation_index) else {
            return Err(HistoryInconsistency {
                trial_no: score_trial_no.to_string(),
            }
            .into());
        };
        if string_field(evaluation, "TrialNo")? != score_trial_no {
            return Err(HistoryInconsistency {
                trial_no: score_trial_no.to_string(),
            }
            .into());
        }

        cache.append(Trial {
            trial_no: score_trial_no.to_string(),
            objective: decimal_to_float(evaluation.get("Objective").unwrap_or(&Attr::Null)),
            constraint: decimal_to_float(evaluation.get("Constraint").unwrap_or(&Attr::Null)),
            info: decimal_to_float(evaluation.get("Info").unwrap_or(&Attr::Null)),
            score: decimal_to_float(score.get("Value").unwrap_or(&Attr::Null)),
            feasible: optional_bool_field(evaluation, "Feasible")?,
        })?;
    }
    Ok(())
}

/// Append a freshly scored trial to the participant's cache.
pub fn write_to_cache(
    cache: &mut Cache,
    match_id: &str,
    participant_id: &str,
    trial: Trial,
) -> Result<(), CacheError> {
    cache.load(&format!("{match_id}#{participant_id}"))?;
    cache.append(trial)
}
