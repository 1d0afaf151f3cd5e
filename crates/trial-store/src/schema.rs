//! The attribute model of stored records.

use bigdecimal::BigDecimal;
use std::collections::BTreeMap;

/// A single attribute value of a stored record.
///
/// The store carries all numbers as fixed-point decimals held by their
/// lexical form (`N`), never as binary floats. Record shapes are dynamic —
/// success and failed records share a partition — so records are attribute
/// maps dispatched on their `Status` attribute rather than fixed structs.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    S(String),
    N(BigDecimal),
    Bool(bool),
    Null,
    L(Vec<Attr>),
    M(BTreeMap<String, Attr>),
}

/// One stored record: attribute name to value.
pub type Item = BTreeMap<String, Attr>;

/// The composite primary key of every record: partition key `ID` plus sort
/// key `Trial`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub id: String,
    pub trial: String,
}

impl Attr {
    pub fn as_s(&self) -> Option<&str> {
        match self {
            Attr::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A required string attribute of `item`.
pub fn string_field<'i>(item: &'i Item, name: &str) -> anyhow::Result<&'i str> {
    item.get(name)
        .and_then(Attr::as_s)
        .ok_or_else(|| anyhow::anyhow!("record is missing string attribute {name:?}"))
}

/// A boolean attribute that may be absent or null.
pub fn optional_bool_field(item: &Item, name: &str) -> anyhow::Result<Option<bool>> {
    match item.get(name) {
        None | Some(Attr::Null) => Ok(None),
        Some(Attr::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(anyhow::anyhow!(
            "attribute {name:?} is not a boolean: {other:?}"
        )),
    }
}
