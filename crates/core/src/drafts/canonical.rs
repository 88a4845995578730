//! Canonical payload form and fingerprints.
//!
//! Two payloads that mean the same thing must canonicalize to the same bytes: object keys are
//! emitted in sorted order and numeric fields are coerced through [`Decimal`] so that `"10.50"`,
//! `10.5` and `"10.5"` are indistinguishable. Empty or unparseable numeric cells take the rule's
//! default value.

use std::collections::BTreeSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Which fields hold numbers and what an unreadable cell becomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalRules {
    numeric_fields: BTreeSet<String>,
    default_number: Decimal,
}

impl CanonicalRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules coercing the given field names (at any depth) to numbers.
    pub fn numeric<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            numeric_fields: fields.into_iter().map(Into::into).collect(),
            default_number: Decimal::ZERO,
        }
    }

    pub fn with_default(mut self, default_number: Decimal) -> Self {
        self.default_number = default_number;
        self
    }

    pub fn is_numeric(&self, field: &str) -> bool {
        self.numeric_fields.contains(field)
    }

    pub fn default_number(&self) -> Decimal {
        self.default_number
    }
}

/// Canonical form of `value` under `rules`.
pub fn canonicalize(value: &Value, rules: &CanonicalRules) -> Value {
    canonicalize_value(value, rules, false)
}

fn canonicalize_value(value: &Value, rules: &CanonicalRules, numeric: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                let field_numeric = rules.is_numeric(key);
                out.insert(
                    key.clone(),
                    canonicalize_value(&map[key.as_str()], rules, field_numeric),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| canonicalize_value(item, rules, numeric))
                .collect(),
        ),
        _ if numeric => decimal_to_value(coerce_decimal(value).unwrap_or(rules.default_number)),
        Value::Number(_) => match coerce_decimal(value) {
            Some(decimal) => decimal_to_value(decimal),
            None => value.clone(),
        },
        other => other.clone(),
    }
}

/// Reads a cell as a decimal. Strings are trimmed; blanks, booleans and nulls are `None`.
pub fn coerce_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(text) => parse_decimal(text.trim()),
        Value::Number(number) => parse_decimal(&number.to_string()),
        _ => None,
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn decimal_to_value(decimal: Decimal) -> Value {
    let normalized = decimal.normalize().to_string();
    match Number::from_str(&normalized) {
        Ok(number) => Value::Number(number),
        Err(_) => Value::String(normalized),
    }
}

/// Compact serialization of an already canonical value.
pub fn canonical_string(value: &Value) -> String {
    value.to_string()
}

/// Equality proxy for "nothing meaningful changed": `sha256:<hex>` of the canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a canonical value.
    pub fn of(canonical: &Value) -> Self {
        let digest = Sha256::digest(canonical_string(canonical).as_bytes());
        let hex = digest
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<String>();
        Self(format!("sha256:{}", hex))
    }

    /// Canonicalizes `value` and fingerprints the result.
    pub fn of_payload(value: &Value, rules: &CanonicalRules) -> Self {
        Self::of(&canonicalize(value, rules))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
