//! The DynamoDB-backed store client.

use crate::schema::{Attr, Item, PrimaryKey};
use crate::{Store, StoreError};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use bigdecimal::BigDecimal;
use exponential_backoff::Backoff;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

/// Retries of a failed request, beyond the initial attempt. Past this the
/// error surfaces and the dispatch loop leans on queue redelivery instead.
const RETRIES: u32 = 3;
const RETRY_MIN: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(5);

pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl Store for DynamoStore {
    async fn check_accessible(&self) -> Result<(), StoreError> {
        self.client
            .get_item()
            .table_name(&self.table_name)
            .key("ID", AttributeValue::S("dummyID".to_string()))
            .key("Trial", AttributeValue::S("dummyTrial".to_string()))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_item(&self, key: &PrimaryKey) -> Result<Option<Item>, StoreError> {
        let backoff = retry_backoff();
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key("ID", AttributeValue::S(key.id.clone()))
                .key("Trial", AttributeValue::S(key.trial.clone()))
                .send()
                .await;
            match result {
                Ok(output) => return output.item().map(item_from_dynamodb).transpose(),
                Err(err) => {
                    attempt += 1;
                    let Some(delay) = backoff.next(attempt) else {
                        return Err(unavailable(err));
                    };
                    tracing::warn!(attempt, error = %err, "store read failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn put_item(&self, item: Item) -> Result<(), StoreError> {
        let attributes: HashMap<String, AttributeValue> = item
            .iter()
            .map(|(k, v)| (k.clone(), attr_to_dynamodb(v)))
            .collect();

        let backoff = retry_backoff();
        let mut attempt = 0;
        loop {
            // Create-only: the write is dropped if the (ID, Trial) pair
            // already exists, which absorbs duplicate queue deliveries.
            let result = self
                .client
                .put_item()
                .table_name(&self.table_name)
                .set_item(Some(attributes.clone()))
                .condition_expression("attribute_not_exists(#id) AND attribute_not_exists(#trial)")
                .expression_attribute_names("#id", "ID")
                .expression_attribute_names("#trial", "Trial")
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err)
                    if err
                        .as_service_error()
                        .map_or(false, |e| e.is_conditional_check_failed_exception()) =>
                {
                    tracing::warn!("the item already exists");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    let Some(delay) = backoff.next(attempt) else {
                        return Err(unavailable(err));
                    };
                    tracing::warn!(attempt, error = %err, "store write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn query_range(
        &self,
        partition: &str,
        lo: &str,
        hi: &str,
        projection: &[&str],
    ) -> Result<Vec<Item>, StoreError> {
        // Attribute names are always aliased; projected attributes like
        // `Value` collide with DynamoDB reserved words otherwise.
        let mut request = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("#id = :id AND #trial BETWEEN :lo AND :hi")
            .expression_attribute_names("#id", "ID")
            .expression_attribute_names("#trial", "Trial")
            .expression_attribute_values(":id", AttributeValue::S(partition.to_string()))
            .expression_attribute_values(":lo", AttributeValue::S(lo.to_string()))
            .expression_attribute_values(":hi", AttributeValue::S(hi.to_string()));

        if !projection.is_empty() {
            let mut aliases = Vec::new();
            for (index, attribute) in projection.iter().enumerate() {
                let alias = format!("#p{index}");
                request = request.expression_attribute_names(alias.clone(), attribute.to_string());
                aliases.push(alias);
            }
            request = request.projection_expression(aliases.join(","));
        }

        let mut items = Vec::new();
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let backoff = retry_backoff();
            let mut attempt = 0;
            let output = loop {
                let result = request
                    .clone()
                    .set_exclusive_start_key(exclusive_start_key.clone())
                    .send()
                    .await;
                match result {
                    Ok(output) => break output,
                    Err(err) => {
                        attempt += 1;
                        let Some(delay) = backoff.next(attempt) else {
                            return Err(unavailable(err));
                        };
                        tracing::warn!(attempt, error = %err, "store query failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            };

            for attributes in output.items() {
                items.push(item_from_dynamodb(attributes)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                _ => return Ok(items),
            }
        }
    }
}

fn retry_backoff() -> Backoff {
    Backoff::new(RETRIES, RETRY_MIN, Some(RETRY_MAX))
}

fn unavailable<E: std::error::Error + Send + Sync + 'static>(err: E) -> StoreError {
    StoreError::Unavailable(Box::new(err))
}

fn item_from_dynamodb(attributes: &HashMap<String, AttributeValue>) -> Result<Item, StoreError> {
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), attr_from_dynamodb(v)?)))
        .collect()
}

fn attr_to_dynamodb(attr: &Attr) -> AttributeValue {
    match attr {
        Attr::S(s) => AttributeValue::S(s.clone()),
        Attr::N(n) => AttributeValue::N(n.to_string()),
        Attr::Bool(b) => AttributeValue::Bool(*b),
        Attr::Null => AttributeValue::Null(true),
        Attr::L(items) => AttributeValue::L(items.iter().map(attr_to_dynamodb).collect()),
        Attr::M(fields) => AttributeValue::M(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), attr_to_dynamodb(v)))
                .collect(),
        ),
    }
}

fn attr_from_dynamodb(value: &AttributeValue) -> Result<Attr, StoreError> {
    Ok(match value {
        AttributeValue::S(s) => Attr::S(s.clone()),
        AttributeValue::N(n) => Attr::N(
            BigDecimal::from_str(n)
                .map_err(|_| StoreError::Decode(format!("invalid decimal {n:?}")))?,
        ),
        AttributeValue::Bool(b) => Attr::Bool(*b),
        AttributeValue::Null(_) => Attr::Null,
        AttributeValue::L(items) => Attr::L(
            items
                .iter()
                .map(attr_from_dynamodb)
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::M(fields) => Attr::M(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), attr_from_dynamodb(v)?)))
                .collect::<Result<BTreeMap<_, _>, StoreError>>()?,
        ),
        other => {
            return Err(StoreError::Decode(format!(
                "unsupported attribute value {other:?}"
            )))
        }
    })
}
