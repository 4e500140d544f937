//! # Envelopes
//!
//! The `{targetId, method, data}` structure shared by requests and responses.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// Pseudo-method that constructs an instance of the class named by `targetId`.
pub const CREATE: &str = "__create__";
/// Pseudo-method that destroys the instance named by `targetId`.
pub const DELETE: &str = "__delete__";
/// No registered method name may start with this.
pub const RESERVED_PREFIX: &str = "__";
/// Highest positional argument accepted, as in `_255`.
pub const MAX_ARGS: usize = 255;

/// Returns the wire key for the zero-based argument `index` (`0` -> `_1`).
pub fn positional_key(index: usize) -> String {
    format!("_{}", index + 1)
}

/// Parses a wire key back to a zero-based index. `_0` and non-numeric keys are rejected.
pub fn parse_positional_key(key: &str) -> Option<usize> {
    let n: usize = key.strip_prefix('_')?.parse().ok()?;
    n.checked_sub(1)
}

/// Packs values into a positional `data` mapping.
pub fn positional(values: impl IntoIterator<Item = Value>) -> Map<String, Value> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| (positional_key(i), v))
        .collect()
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub method: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(target_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            method: method.into(),
            data: Map::new(),
        }
    }

    /// Replaces `data` with the given positional arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.data = positional(args);
        self
    }

    /// Positional arguments in call order.
    ///
    /// Keys that are not `_<n>` are ignored; missing positions below the
    /// highest one present are filled with `null`. Positions past
    /// [`MAX_ARGS`] are dropped here and rejected by [`Envelope::validate`].
    pub fn args(&self) -> Vec<Value> {
        let mut indexed: Vec<(usize, &Value)> = self
            .data
            .iter()
            .filter_map(|(k, v)| parse_positional_key(k).map(|i| (i, v)))
            .filter(|(i, _)| *i < MAX_ARGS)
            .collect();
        indexed.sort_by_key(|(i, _)| *i);

        let len = indexed.last().map_or(0, |(i, _)| i + 1);
        let mut args = vec![Value::Null; len];
        for (i, v) in indexed {
            args[i] = v.clone();
        }
        args
    }

    /// Fails if any positional key lies past [`MAX_ARGS`].
    pub fn validate(&self) -> Result<()> {
        let out_of_range = self
            .data
            .keys()
            .find(|k| parse_positional_key(k).is_some_and(|i| i >= MAX_ARGS));
        match out_of_range {
            Some(key) => Err(Error::InvalidEnvelope(format!(
                "argument `{key}` exceeds the limit of {MAX_ARGS} positional arguments"
            ))),
            None => Ok(()),
        }
    }

    pub fn is_create(&self) -> bool {
        self.method == CREATE
    }

    pub fn is_delete(&self) -> bool {
        self.method == DELETE
    }
}

/// The `data` of a response or a completion: exactly one of `r` or `e`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "r")]
    Ok(Value),
    #[serde(rename = "e")]
    Err(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl From<std::result::Result<Value, String>> for Outcome {
    fn from(r: std::result::Result<Value, String>) -> Self {
        match r {
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Err(e),
        }
    }
}

/// A response envelope, echoing the request's `targetId` and `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "targetId")]
    pub target_id: String,
    pub method: String,
    pub data: Outcome,
}

impl Response {
    pub fn ok(request: &Envelope, value: Value) -> Self {
        Self::with_outcome(request, Outcome::Ok(value))
    }

    pub fn err(request: &Envelope, message: impl Into<String>) -> Self {
        Self::with_outcome(request, Outcome::Err(message.into()))
    }

    pub fn with_outcome(request: &Envelope, data: Outcome) -> Self {
        Self {
            target_id: request.target_id.clone(),
            method: request.method.clone(),
            data,
        }
    }

    /// The `r` value, if the call succeeded.
    pub fn result(&self) -> Option<&Value> {
        match &self.data {
            Outcome::Ok(v) => Some(v),
            Outcome::Err(_) => None,
        }
    }

    /// The `e` message, if the call failed.
    pub fn error(&self) -> Option<&str> {
        match &self.data {
            Outcome::Ok(_) => None,
            Outcome::Err(e) => Some(e),
        }
    }
}
