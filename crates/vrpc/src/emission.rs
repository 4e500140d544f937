//! # Emissions
//!
//! Messages delivered on the global channel after `dispatch` has returned:
//! a promise resolving or rejecting, or a callback firing.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::envelope::Outcome;
use crate::envelope::positional;
use crate::sentinel::Sentinel;

/// `{id, data}` as seen by the registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub id: String,
    pub data: Payload,
}

/// Promise completions carry an [`Outcome`]; callback firings carry the
/// callback's own arguments keyed `_1`, `_2`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Outcome(Outcome),
    Args(Map<String, Value>),
}

impl Emission {
    pub fn completed(sentinel: &Sentinel, outcome: Outcome) -> Self {
        Self {
            id: sentinel.literal(),
            data: Payload::Outcome(outcome),
        }
    }

    pub fn fired(sentinel: &Sentinel, args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            id: sentinel.literal(),
            data: Payload::Args(positional(args)),
        }
    }

    pub fn sentinel(&self) -> Option<Sentinel> {
        Sentinel::parse(&self.id)
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.data {
            Payload::Outcome(o) => Some(o),
            Payload::Args(_) => None,
        }
    }

    pub fn args(&self) -> Option<&Map<String, Value>> {
        match &self.data {
            Payload::Outcome(_) => None,
            Payload::Args(a) => Some(a),
        }
    }
}
