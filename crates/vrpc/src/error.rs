//! # Error Definitions
//!
//! Structural failures: the input never became a well-formed envelope, so there
//! is no `targetId`/`method` to echo back and nothing is sent over the channel.
//! Logical failures (unknown target, unknown method, native errors) are not
//! errors at this layer; they travel inside a [`crate::Response`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The binding was handed zero or several arguments.
    #[error("Wrong number of arguments, expecting exactly one")]
    Arity,
    /// The binding was handed a single non-string argument.
    #[error("Wrong argument type, expecting string")]
    ArgumentType,
    /// The input string was empty or whitespace only.
    #[error("Failed converting argument to valid and non-empty string")]
    EmptyInput,
    /// The input was not well-formed JSON. The message carries the parser position.
    #[error("parse error: {0}")]
    Parse(#[source] serde_json::Error),
    /// Well-formed JSON, but not shaped like an envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// Serializing an outgoing message failed.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
