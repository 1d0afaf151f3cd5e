//! Resolution of a match id into its problem and indicator artifacts.
//!
//! The platform's GraphQL endpoint is queried with `graphql_client`; the
//! query lives in `src/get_match.graphql` beside this module and is checked
//! against `schema.graphql` at compile time. Each artifact carries a public
//! environment map (values always present) and a private one (values may be
//! withheld from unauthorized callers); the two are merged per artifact, and
//! a withheld private value is a hard error.

use async_trait::async_trait;
use graphql_client::GraphQLQuery;
use std::collections::BTreeMap;

/// A resolved match: the two container images and their merged environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub id: String,
    pub problem_image: String,
    pub problem_environments: BTreeMap<String, String>,
    pub indicator_image: String,
    pub indicator_environments: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("match request failed")]
    Http(#[from] reqwest::Error),
    #[error("match query returned errors: {0}")]
    Graphql(String),
    #[error("match {0} not found")]
    NotFound(String),
    #[error("cannot access the docker image of match {0}; sign in with an account authorized for it")]
    ImageNotFound(String),
    #[error("private environment {key} has no value")]
    MissingPrivateEnvironment { key: String },
}

#[async_trait]
pub trait MatchResolver: Send + Sync {
    async fn fetch_match_by_id(&self, match_id: &str) -> Result<Match, MatchError>;
}

#[derive(GraphQLQuery)]
#[graphql(
    schema_path = "schema.graphql",
    query_path = "src/get_match.graphql",
    response_derives = "Debug, Clone"
)]
struct GetMatch;

/// Resolver backed by the platform's GraphQL endpoint.
pub struct GraphQlMatchResolver {
    http: reqwest::Client,
    endpoint: url::Url,
    bearer_token: Option<String>,
}

impl GraphQlMatchResolver {
    pub fn new(endpoint: url::Url, bearer_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            bearer_token,
        }
    }
}

#[async_trait]
impl MatchResolver for GraphQlMatchResolver {
    #[tracing::instrument(level = tracing::Level::DEBUG, err, skip(self))]
    async fn fetch_match_by_id(&self, match_id: &str) -> Result<Match, MatchError> {
        let body = GetMatch::build_query(get_match::Variables {
            id: match_id.to_string(),
        });

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response: graphql_client::Response<get_match::ResponseData> =
            request.send().await?.error_for_status()?.json().await?;

        if let Some(errors) = response.errors.filter(|errors| !errors.is_empty()) {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(MatchError::Graphql(joined));
        }
        let data = response
            .data
            .ok_or_else(|| MatchError::Graphql("response contained no data".to_string()))?;
        let fetched = data
            .get_match
            .ok_or_else(|| MatchError::NotFound(match_id.to_string()))?;

        // An absent image means the signed-in account is not authorized for
        // the match, which no retry will fix.
        let problem_image = fetched
            .problem
            .docker_image
            .ok_or_else(|| MatchError::ImageNotFound(match_id.to_string()))?;
        let indicator_image = fetched
            .indicator
            .docker_image
            .ok_or_else(|| MatchError::ImageNotFound(match_id.to_string()))?;

        let mut problem_environments = BTreeMap::new();
        for entry in &fetched.problem_public_environments {
            problem_environments.insert(entry.key.clone(), entry.value.clone());
        }
        for entry in &fetched.problem_private_environments {
            let value = entry.value.clone().ok_or_else(|| {
                MatchError::MissingPrivateEnvironment {
                    key: entry.key.clone(),
                }
            })?;
            problem_environments.insert(entry.key.clone(), value);
        }

        let mut indicator_environments = BTreeMap::new();
        for entry in &fetched.indicator_public_environments {
            indicator_environments.insert(entry.key.clone(), entry.value.clone());
        }
        for entry in &fetched.indicator_private_environments {
            let value = entry.value.clone().ok_or_else(|| {
                MatchError::MissingPrivateEnvironment {
                    key: entry.key.clone(),
                }
            })?;
            indicator_environments.insert(entry.key.clone(), value);
        }

        Ok(Match {
            id: fetched.id,
            problem_image,
            problem_environments,
            indicator_image,
            indicator_environments,
        })
    }
}
