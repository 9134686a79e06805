//! Element search: an optional kind plus `field=value` filters, all of which
//! must match.

use std::collections::BTreeMap;

use serde_json::Value;

use drawbridge_core::element::{Element, ElementKind};
use drawbridge_core::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementQuery {
    pub kind: Option<ElementKind>,
    /// Field path (camelCase, dotted for nested objects) → expected value.
    pub filters: BTreeMap<String, String>,
}

impl ElementQuery {
    /// Build a query from raw query-string pairs. `type` selects the kind;
    /// every other pair becomes a field filter.
    pub fn from_params<I, K, V>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut query = Self::default();
        for (key, value) in params {
            let key = key.into();
            let value = value.into();
            if key == "type" {
                query.kind = Some(value.parse()?);
            } else {
                query.filters.insert(key, value);
            }
        }
        Ok(query)
    }

    pub fn matches(&self, element: &Element) -> bool {
        if let Some(kind) = self.kind {
            if element.kind != kind {
                return false;
            }
        }
        if self.filters.is_empty() {
            return true;
        }

        let Ok(json) = serde_json::to_value(element) else {
            return false;
        };
        self.filters
            .iter()
            .all(|(path, expected)| lookup(&json, path).is_some_and(|v| scalar_eq(v, expected)))
    }

    pub fn apply<'a>(&self, elements: impl IntoIterator<Item = &'a Element>) -> Vec<Element> {
        elements
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect()
    }
}

fn lookup<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(json, |current, segment| current.get(segment))
}

fn scalar_eq(actual: &Value, expected: &str) -> bool {
    match actual {
        Value::String(s) => s == expected,
        Value::Number(n) => match (n.as_f64(), expected.parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => false,
        },
        Value::Bool(b) => expected.parse::<bool>().is_ok_and(|e| e == *b),
        Value::Null => expected == "null",
        Value::Array(_) | Value::Object(_) => false,
    }
}
