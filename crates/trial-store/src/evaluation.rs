//! Reading and writing evaluation records.
//!
//! Evaluations live under `ID = Evaluations#<MatchID>#<ParticipantID>` with
//! sort key `Success#<n>` or `Failed#<n>`; the tag is load-bearing, since the
//! scorer range-scans the `Success#` series.

use crate::convert::{decimal_to_float, number_to_decimal};
use crate::schema::{optional_bool_field, string_field, Attr, Item, PrimaryKey};
use crate::Store;
use serde_json::Value;

/// Input for the record written after the problem container succeeded.
#[derive(Debug, Clone)]
pub struct SuccessEvaluationInput {
    pub match_id: String,
    pub participant_id: String,
    pub trial_no: String,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    pub objective: Value,
    pub constraint: Value,
    pub info: Value,
    pub feasible: Option<bool>,
}

/// Input for the record written when evaluating a trial failed.
#[derive(Debug, Clone)]
pub struct FailedEvaluationInput {
    pub match_id: String,
    pub participant_id: String,
    pub trial_no: String,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    /// Participant-visible failure text.
    pub error_message: String,
    /// Operator-visible failure text.
    pub admin_error_message: String,
}

/// A success evaluation as read back for scoring, decimals decoded to plain
/// JSON numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessEvaluation {
    pub match_id: String,
    pub participant_id: String,
    pub trial_no: String,
    pub objective: Value,
    pub constraint: Value,
    pub info: Value,
    pub feasible: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("evaluation not found")]
pub struct EvaluationNotFound;

pub async fn save_success_evaluation(
    store: &dyn Store,
    input: &SuccessEvaluationInput,
) -> anyhow::Result<()> {
    let mut item = Item::new();
    item.insert(
        "ID".into(),
        Attr::S(format!(
            "Evaluations#{}#{}",
            input.match_id, input.participant_id
        )),
    );
    item.insert("Trial".into(), Attr::S(format!("Success#{}", input.trial_no)));
    item.insert("TrialNo".into(), Attr::S(input.trial_no.clone()));
    item.insert("ResourceType".into(), Attr::S("Evaluation".into()));
    item.insert("MatchID".into(), Attr::S(input.match_id.clone()));
    item.insert("CreatedAt".into(), Attr::S(input.created_at.clone()));
    item.insert("ParticipantID".into(), Attr::S(input.participant_id.clone()));
    item.insert("StartedAt".into(), Attr::S(input.started_at.clone()));
    item.insert("FinishedAt".into(), Attr::S(input.finished_at.clone()));
    item.insert("Status".into(), Attr::S("Success".into()));
    item.insert("Objective".into(), number_to_decimal(&input.objective));
    item.insert("Constraint".into(), number_to_decimal(&input.constraint));
    item.insert("Info".into(), number_to_decimal(&input.info));
    item.insert(
        "Feasible".into(),
        match input.feasible {
            Some(feasible) => Attr::Bool(feasible),
            None => Attr::Null,
        },
    );
    store.put_item(item).await?;
    Ok(())
}

pub async fn save_failed_evaluation(
    store: &dyn Store,
    input: &FailedEvaluationInput,
) -> anyhow::Result<()> {
    let mut item = Item::new();
    item.insert(
        "ID".into(),
        Attr::S(format!(
            "Evaluations#{}#{}",
            input.match_id, input.participant_id
        )),
    );
    item.insert("Trial".into(), Attr::S(format!("Failed#{}", input.trial_no)));
    item.insert("TrialNo".into(), Attr::S(input.trial_no.clone()));
    item.insert("ResourceType".into(), Attr::S("Evaluation".into()));
    item.insert("MatchID".into(), Attr::S(input.match_id.clone()));
    item.insert("CreatedAt".into(), Attr::S(input.created_at.clone()));
    item.insert("ParticipantID".into(), Attr::S(input.participant_id.clone()));
    item.insert("StartedAt".into(), Attr::S(input.started_at.clone()));
    item.insert("FinishedAt".into(), Attr::S(input.finished_at.clone()));
    item.insert("Status".into(), Attr::S("Failed".into()));
    item.insert("ErrorMessage".into(), Attr::S(input.error_message.clone()));
    item.insert(
        "AdminErrorMessage".into(),
        Attr::S(input.admin_error_message.clone()),
    );
    store.put_item(item).await?;
    Ok(())
}

pub async fn fetch_success_evaluation_by_primary_key(
    store: &dyn Store,
    match_id: &str,
    participant_id: &str,
    trial_no: &str,
) -> anyhow::Result<SuccessEvaluation> {
    let key = PrimaryKey {
        id: format!("Evaluations#{match_id}#{participant_id}"),
        trial: format!("Success#{trial_no}"),
    };
    let item = store.get_item(&key).await?.ok_or(EvaluationNotFound)?;

    Ok(SuccessEvaluation {
        match_id: string_field(&item, "MatchID")?.to_string(),
        participant_id: string_field(&item, "ParticipantID")?.to_string(),
        trial_no: string_field(&item, "TrialNo")?.to_string(),
        objective: decimal_to_float(item.get("Objective").unwrap_or(&Attr::Null)),
        constraint: decimal_to_float(item.get("Constraint").unwrap_or(&Attr::Null)),
        info: decimal_to_float(item.get("Info").unwrap_or(&Attr::Null)),
        feasible: optional_bool_field(&item, "Feasible")?,
    })
}

/// Whether any evaluation, success or failed, was already persisted for the
/// trial. The idempotency guard of the dispatch loop.
pub async fn is_evaluation_exists(
    store: &dyn Store,
    match_id: &str,
    participant_id: &str,
    trial_no: &str,
) -> anyhow::Result<bool> {
    let id = format!("Evaluations#{match_id}#{participant_id}");
    for tag in ["Success", "Failed"] {
        let key = PrimaryKey {
            id: id.clone(),
            trial: format!("{tag}#{trial_no}"),
        };
        if store.get_item(&key).await?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}
