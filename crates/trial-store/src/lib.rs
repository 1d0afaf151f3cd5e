//! Client layer for the platform's key/sort-key store.
//!
//! Every persisted record lives in a single namespace keyed by partition key
//! `ID` and sort key `Trial`. Solutions are written upstream and read here;
//! evaluations and scores are written here exactly once per trial, enforced
//! by a create-only conditional write. The [`Store`] trait is the contract;
//! [`DynamoStore`] is the production client and [`MemoryStore`] backs tests
//! and local development.

pub mod convert;
pub mod dynamodb;
pub mod evaluation;
pub mod memory;
pub mod schema;
pub mod score;
pub mod solution;
pub mod zfill;

pub use dynamodb::DynamoStore;
pub use memory::MemoryStore;
pub use schema::{Attr, Item, PrimaryKey};

use async_trait::async_trait;

/// Errors surfaced by a store client. A conditional-write conflict is not an
/// error: `put_item` absorbs it, because duplicate queue deliveries land
/// there by design of the at-least-once pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("malformed record: {0}")]
    Decode(String),
}

/// The key/sort-key store contract: point reads, create-only writes, and
/// ordered range scans within one partition.
#[async_trait]
pub trait Store: Send + Sync {
    /// Perform a benign read to validate credentials and endpoint at startup.
    async fn check_accessible(&self) -> Result<(), StoreError>;

    /// Fetch one record by its composite key.
    async fn get_item(&self, key: &PrimaryKey) -> Result<Option<Item>, StoreError>;

    /// Write `item`, succeeding only if no record with its (ID, Trial)
    /// exists. A conditional conflict is logged and absorbed.
    async fn put_item(&self, item: Item) -> Result<(), StoreError>;

    /// Records of `partition` whose sort key lies in the closed interval
    /// `[lo, hi]`, in ascending sort-key order. A non-empty `projection`
    /// restricts the returned attributes.
    async fn query_range(
        &self,
        partition: &str,
        lo: &str,
        hi: &str,
        projection: &[&str],
    ) -> Result<Vec<Item>, StoreError>;
}
