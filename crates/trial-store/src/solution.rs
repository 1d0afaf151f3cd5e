//! Reading solution records. Solutions are written by the submission
//! pipeline and are read-only here.

use crate::convert::decimal_to_float;
use crate::schema::{Attr, PrimaryKey};
use crate::Store;
use serde_json::Value;

/// A participant's submitted candidate, decimals decoded to plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub variable: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("solution not found")]
pub struct SolutionNotFound;

pub async fn fetch_solution_by_primary_key(
    store: &dyn Store,
    match_id: &str,
    participant_id: &str,
    trial: &str,
) -> anyhow::Result<Solution> {
    let key = PrimaryKey {
        id: format!("Solutions#{match_id}#{participant_id}"),
        trial: trial.to_string(),
    };
    let item = store.get_item(&key).await?.ok_or(SolutionNotFound)?;

    Ok(Solution {
        variable: decimal_to_float(item.get("Variable").unwrap_or(&Attr::Null)),
    })
}
