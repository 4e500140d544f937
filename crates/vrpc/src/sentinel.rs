//! # Sentinels
//!
//! Strings that stand in for a function or a pending result where a plain JSON
//! value would otherwise go. Only the wire uses the prefix convention; inside
//! the adapter a sentinel is always this tagged type.

use std::fmt;

use serde_json::Value;

pub const PROMISE_PREFIX: &str = "__p__";
pub const CALLBACK_PREFIX: &str = "__f__";

/// A parsed sentinel. The payload is the part after the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// One-shot completion of an asynchronous result.
    Promise(String),
    /// Caller-named function reference; may fire any number of times.
    Callback(String),
}

impl Sentinel {
    /// Parses a wire string. Returns `None` for plain strings and for a bare
    /// prefix with an empty name.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix(PROMISE_PREFIX) {
            return (!rest.is_empty()).then(|| Self::Promise(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix(CALLBACK_PREFIX) {
            return (!rest.is_empty()).then(|| Self::Callback(rest.to_string()));
        }
        None
    }

    /// Parses a JSON argument. Only top-level strings can be sentinels.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(Self::parse)
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Self::Promise(_))
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Promise(name) | Self::Callback(name) => name,
        }
    }

    /// The wire literal, prefix included.
    pub fn literal(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise(name) => write!(f, "{PROMISE_PREFIX}{name}"),
            Self::Callback(name) => write!(f, "{CALLBACK_PREFIX}{name}"),
        }
    }
}
