//! Wire values exchanged between the parent and its workers.
//!
//! Plain JSON cannot carry maps with non-string keys, sets, dates, regular
//! expressions, byte buffers or error instances. [`Value`] is an explicit
//! tagged union covering exactly those shapes; nothing is ever evaluated on
//! the receiving side.
//!
//! Typed payloads (run options, results) go through serde: [`Value::encode`]
//! and [`Value::decode`] bridge any `Serialize`/`Deserialize` type.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// A value that can cross the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Non-finite floats travel as `null` and come back as NaN.
    Float(#[serde(deserialize_with = "float_or_nan")] f64),
    String(String),
    Array(Vec<Value>),
    /// String-keyed record.
    Object(BTreeMap<String, Value>),
    /// Map with arbitrary keys, insertion ordered.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Date(DateTime<Utc>),
    RegExp { source: String, flags: String },
    Bytes(Vec<u8>),
    Error(ErrorValue),
}

fn float_or_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Rehydratable error instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Error kind, e.g. `"TypeError"` or `"StryxError"`.
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Capture a Rust error together with its cause chain as the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            name: "Error".to_string(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorValue {}

impl Value {
    /// Encode any serializable type.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Decode into a deserializable type.
    ///
    /// Rich shapes are lowered first (see [`Value::into_json`]).
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.into_json())
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Lower into plain JSON.
    ///
    /// Maps whose keys are all strings become objects, other maps become
    /// arrays of `[key, value]` pairs. Sets become arrays, dates RFC 3339
    /// strings, regular expressions `/source/flags` strings, bytes arrays of
    /// numbers and errors objects. Non-finite floats become `null`.
    pub fn into_json(self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(b),
            Self::Int(i) => Json::from(i),
            Self::Float(f) => serde_json::Number::from_f64(f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Self::String(s) => Json::String(s),
            Self::Array(items) | Self::Set(items) => {
                Json::Array(items.into_iter().map(Self::into_json).collect())
            }
            Self::Object(map) => Json::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect(),
            ),
            Self::Map(entries) => {
                if entries.iter().all(|(k, _)| matches!(k, Self::String(_))) {
                    Json::Object(
                        entries
                            .into_iter()
                            .filter_map(|(k, v)| match k {
                                Self::String(key) => Some((key, v.into_json())),
                                _ => None,
                            })
                            .collect(),
                    )
                } else {
                    Json::Array(
                        entries
                            .into_iter()
                            .map(|(k, v)| Json::Array(vec![k.into_json(), v.into_json()]))
                            .collect(),
                    )
                }
            }
            Self::Date(date) => Json::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::RegExp { source, flags } => Json::String(format!("/{}/{}", source, flags)),
            Self::Bytes(bytes) => Json::Array(bytes.into_iter().map(Json::from).collect()),
            Self::Error(error) => serde_json::to_value(error).unwrap_or(Json::Null),
        }
    }

    /// Look up a field of an [`Value::Object`].
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Self::Error(error)
    }
}
