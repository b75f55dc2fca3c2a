//! Raw, untrusted input.
//!
//! Params map field names to raw JSON values. Keys are either symbols
//! (names known at compile time) or text (names that arrived from the
//! outside, such as form or JSON keys). A single params map must not mix
//! the two.

use crate::{error::Result, Error};
use indexmap::IndexMap;
use serde_json::Value as Json;

/// A params key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Symbol(&'static str),
    Text(String),
}

impl ParamKey {
    pub fn symbol(name: &'static str) -> Self {
        ParamKey::Symbol(name)
    }

    pub fn text(name: impl Into<String>) -> Self {
        ParamKey::Text(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ParamKey::Symbol(name) => name,
            ParamKey::Text(name) => name,
        }
    }
}

/// Raw input, normalized to string keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: IndexMap<String, Json>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build params from keyed entries.
    ///
    /// Fails with [`Error::MixedKeys`] if symbol and text keys are mixed.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ParamKey, Json)>,
    {
        let mut symbol: Option<&'static str> = None;
        let mut text: Option<String> = None;
        let mut params = Params::new();

        for (key, value) in entries {
            match &key {
                ParamKey::Symbol(name) => symbol = symbol.or(Some(*name)),
                ParamKey::Text(name) => {
                    if text.is_none() {
                        text = Some(name.clone());
                    }
                }
            }
            if let (Some(symbol), Some(text)) = (symbol, &text) {
                return Err(Error::MixedKeys {
                    text: text.clone(),
                    symbol: symbol.to_string(),
                });
            }
            params.entries.insert(key.as_str().to_string(), value);
        }

        Ok(params)
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Json) {
        self.entries.insert(key.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into `self`; keys in `other` win.
    pub fn merge(mut self, other: Params) -> Self {
        self.entries.extend(other.entries);
        self
    }
}

impl TryFrom<Json> for Params {
    type Error = Error;

    fn try_from(value: Json) -> Result<Self> {
        match value {
            Json::Object(map) => Ok(Params {
                entries: map.into_iter().collect(),
            }),
            other => Err(Error::InvalidParams(format!(
                "expected an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Conversion into optional params.
///
/// `None` is the "no input supplied" marker: the resulting changeset has no
/// changes and is invalid.
pub trait IntoParams {
    fn into_params(self) -> Result<Option<Params>>;
}

impl IntoParams for Params {
    fn into_params(self) -> Result<Option<Params>> {
        Ok(Some(self))
    }
}

impl IntoParams for Option<Params> {
    fn into_params(self) -> Result<Option<Params>> {
        Ok(self)
    }
}

impl IntoParams for Json {
    fn into_params(self) -> Result<Option<Params>> {
        match self {
            Json::Null => Ok(None),
            other => Params::try_from(other).map(Some),
        }
    }
}

pub(crate) fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_object() {
        let params = Params::try_from(json!({"title": "hello", "visits": "3"})).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params.get("title"), Some(&json!("hello")));
        assert!(!params.contains_key("body"));
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(
            Params::try_from(json!([1, 2])),
            Err(Error::InvalidParams("expected an object, got array".into()))
        );
        assert_eq!(json!(null).into_params(), Ok(None));
    }

    #[test]
    fn symbol_keys_normalize_to_strings() {
        let params = Params::from_entries([
            (ParamKey::symbol("title"), json!("a")),
            (ParamKey::symbol("body"), json!("b")),
        ])
        .unwrap();

        assert_eq!(params.get("title"), Some(&json!("a")));
    }

    #[test]
    fn mixed_keys_are_fatal() {
        let err = Params::from_entries([
            (ParamKey::text("title"), json!("a")),
            (ParamKey::symbol("body"), json!("b")),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            Error::MixedKeys {
                text: "title".into(),
                symbol: "body".into(),
            }
        );
    }

    #[test]
    fn merge_prefers_right_hand_side() {
        let left = Params::try_from(json!({"a": 1, "b": 1})).unwrap();
        let right = Params::try_from(json!({"b": 2})).unwrap();
        let merged = left.merge(right);

        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
    }
}
