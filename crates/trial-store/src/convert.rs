//! Conversions between JSON values and the store's decimal-based attributes.
//!
//! Container payloads and in-process compute work with JSON numbers; the
//! store requires decimals. Numbers cross in both directions through their
//! lexical form so no precision is invented or lost to binary floats.

use crate::schema::Attr;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Convert a JSON value into an attribute tree, turning every numeric leaf
/// into a decimal by way of its string form.
pub fn number_to_decimal(value: &Value) -> Attr {
    match value {
        Value::Null => Attr::Null,
        Value::Bool(b) => Attr::Bool(*b),
        Value::Number(n) => Attr::N(
            BigDecimal::from_str(&n.to_string())
                .expect("a JSON number is always a valid decimal"),
        ),
        Value::String(s) => Attr::S(s.clone()),
        Value::Array(items) => Attr::L(items.iter().map(number_to_decimal).collect()),
        Value::Object(fields) => Attr::M(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), number_to_decimal(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
    }
}

/// Convert an attribute tree back into a JSON value. Integral decimals become
/// JSON integers and the rest become doubles, so decoding an encoded value
/// yields the value itself.
pub fn decimal_to_float(attr: &Attr) -> Value {
    match attr {
        Attr::Null => Value::Null,
        Attr::Bool(b) => Value::Bool(*b),
        Attr::S(s) => Value::String(s.clone()),
        Attr::N(decimal) => decimal_value(decimal),
        Attr::L(items) => Value::Array(items.iter().map(decimal_to_float).collect()),
        Attr::M(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), decimal_to_float(v)))
                .collect(),
        ),
    }
}

fn decimal_value(decimal: &BigDecimal) -> Value {
    if decimal.is_integer() {
        if let Some(n) = decimal.to_i64() {
            return Value::from(n);
        }
    }
    match decimal.to_f64() {
        Some(f) if f.is_finite() => Value::from(f),
        _ if *decimal > BigDecimal::zero() => {
            tracing::warn!(%decimal, "decimal exceeds f64::MAX, clamping");
            Value::from(f64::MAX)
        }
        _ if *decimal < BigDecimal::zero() => {
            tracing::warn!(%decimal, "decimal exceeds -f64::MAX, clamping");
            Value::from(-f64::MAX)
        }
        _ => {
            tracing::warn!(%decimal, "decimal is not representable as a float");
            Value::Null
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_inverts_encode() {
        let value = json!({
            "objective": [0.5, 0.25],
            "constraint": null,
            "info": {"count": 3, "label": "best", "nested": [1, 2.5, true]},
            "feasible": false,
        });
        assert_eq!(decimal_to_float(&number_to_decimal(&value)), value);
    }

    #[test]
    fn numbers_are_carried_lexically() {
        let Attr::N(decimal) = number_to_decimal(&json!(0.1)) else {
            panic!("expected a decimal");
        };
        assert_eq!(decimal, BigDecimal::from_str("0.1").unwrap());
    }

    #[test]
    fn integral_decimals_decode_to_integers() {
        let attr = Attr::N(BigDecimal::from_str("5").unwrap());
        assert_eq!(decimal_to_float(&attr), json!(5));

        let attr = Attr::N(BigDecimal::from_str("5.5").unwrap());
        assert_eq!(decimal_to_float(&attr), json!(5.5));
    }

    #[test]
    fn oversized_decimals_clamp_to_finite_doubles() {
        let attr = Attr::N(BigDecimal::from_str("1e999").unwrap());
        assert_eq!(decimal_to_float(&attr), json!(f64::MAX));

        let attr = Attr::N(BigDecimal::from_str("-1e999").unwrap());
        assert_eq!(decimal_to_float(&attr), json!(-f64::MAX));
    }

    #[test]
    fn non_numeric_leaves_pass_through() {
        let value = json!(["text", true, null]);
        assert_eq!(decimal_to_float(&number_to_decimal(&value)), value);
    }
}
