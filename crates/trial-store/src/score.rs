//! Reading and writing score records.
//!
//! Scores mirror the evaluation sort-key discipline under
//! `ID = Scores#<MatchID>#<ParticipantID>`; a success record carries a single
//! decimal `Value`.

use crate::convert::number_to_decimal;
use crate::schema::{Attr, Item, PrimaryKey};
use crate::Store;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SuccessScoreInput {
    pub match_id: String,
    pub participant_id: String,
    pub trial_no: String,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    pub score: Value,
}

#[derive(Debug, Clone)]
pub struct FailedScoreInput {
    pub match_id: String,
    pub participant_id: String,
    pub trial_no: String,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    pub error_message: String,
    pub admin_error_message: String,
}

pub async fn save_success_score(store: &dyn Store, input: &SuccessScoreInput) -> anyhow::Result<()> {
    let value = match number_to_decimal(&input.score) {
        Attr::N(decimal) => Attr::N(decimal),
        other => anyhow::bail!("score must be numeric, got {other:?}"),
    };

    let mut item = Item::new();
    item.insert(
        "ID".into(),
        Attr::S(format!("Scores#{}#{}", input.match_id, input.participant_id)),
    );
    item.insert("Trial".into(), Attr::S(format!("Success#{}", input.trial_no)));
    item.insert("TrialNo".into(), Attr::S(input.trial_no.clone()));
    item.insert("ResourceType".into(), Attr::S("Score".into()));
    item.insert("MatchID".into(), Attr::S(input.match_id.clone()));
    item.insert("CreatedAt".into(), Attr::S(input.created_at.clone()));
    item.insert("ParticipantID".into(), Attr::S(input.participant_id.clone()));
    item.insert("StartedAt".into(), Attr::S(input.started_at.clone()));
    item.insert("FinishedAt".into(), Attr::S(input.finished_at.clone()));
    item.insert("Status".into(), Attr::S("Success".into()));
    item.insert("Value".into(), value);
    store.put_item(item).await?;
    Ok(())
}

pub async fn save_failed_score(store: &dyn Store, input: &FailedScoreInput) -> anyhow::Result<()> {
    let mut item = Item::new();
    item.insert(
        "ID".into(),
        Attr::S(format!("Scores#{}#{}", input.match_id, input.participant_id)),
    );
    item.insert("Trial".into(), Attr::S(format!("Failed#{}", input.trial_no)));
    item.insert("TrialNo".into(), Attr::S(input.trial_no.clone()));
    item.insert("ResourceType".into(), Attr::S("Score".into()));
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

/// Whether any score, success or failed, was already persisted for the trial.
pub async fn is_score_exists(
    store: &dyn Store,
    match_id: &str,
    participant_id: &str,
    trial_no: &str,
) -> anyhow::Result<bool> {
    let id = format!("Scores#{match_id}#{participant_id}");
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryStore;
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use std::str::FromStr;

    fn success_input(score: Value) -> SuccessScoreInput {
        SuccessScoreInput {
            match_id: "M1".into(),
            participant_id: "P1".into(),
            trial_no: "00001".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            started_at: "2026-01-01T00:00:01.000Z".into(),
            finished_at: "2026-01-01T00:00:02.000Z".into(),
            score,
        }
    }

    #[tokio::test]
    async fn score_is_stored_as_a_decimal() {
        let store = MemoryStore::new();
        save_success_score(&store, &success_input(json!(0.81)))
            .await
            .unwrap();

        let key = PrimaryKey {
            id: "Scores#M1#P1".into(),
            trial: "Success#00001".into(),
        };
        let item = store.get_item(&key).await.unwrap().unwrap();
        assert_eq!(
            item.get("Value"),
            Some(&Attr::N(BigDecimal::from_str("0.81").unwrap()))
        );
    }

    #[tokio::test]
    async fn non_numeric_score_is_rejected() {
        let store = MemoryStore::new();
        let err = save_success_score(&store, &success_input(json!("high")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be numeric"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn exists_probes_both_outcomes() {
        let store = MemoryStore::new();
        assert!(!is_score_exists(&store, "M1", "P1", "00001").await.unwrap());
        save_success_score(&store, &success_input(json!(1)))
            .await
            .unwrap();
        assert!(is_score_exists(&store, "M1", "P1", "00001").await.unwrap());
    }
}
