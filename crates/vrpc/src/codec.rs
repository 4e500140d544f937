//! # Envelope Codec
//!
//! Text <-> envelope conversion. Decoding validates in a fixed order and stops
//! at the first failure:
//!
//! 1. exactly one argument, of string type (binding entry point only)
//! 2. non-empty after trimming
//! 3. well-formed JSON
//! 4. an object with string `targetId` and `method`, and `data` an object if present
//! 5. no positional key past `_255`

use serde_json::Map;
use serde_json::Value;

use crate::emission::Emission;
use crate::envelope::Envelope;
use crate::envelope::Response;
use crate::error::Error;
use crate::error::Result;

/// Decodes the argument list a dynamic binding received.
pub fn decode_args(args: &[Value]) -> Result<Envelope> {
    let [arg] = args else {
        return Err(Error::Arity);
    };
    let text = arg.as_str().ok_or(Error::ArgumentType)?;
    decode(text)
}

/// Decodes a request envelope from its JSON text.
pub fn decode(text: &str) -> Result<Envelope> {
    if text.trim().is_empty() {
        return Err(Error::EmptyInput);
    }

    let value: Value = serde_json::from_str(text).map_err(Error::Parse)?;
    let Value::Object(mut object) = value else {
        return Err(Error::InvalidEnvelope("expected a JSON object".into()));
    };

    let target_id = take_string(&mut object, "targetId")?;
    let method = take_string(&mut object, "method")?;
    let data = match object.remove("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(data)) => data,
        Some(_) => return Err(Error::InvalidEnvelope("`data` must be an object".into())),
    };

    let envelope = Envelope { target_id, method, data };
    envelope.validate()?;
    Ok(envelope)
}

fn take_string(object: &mut Map<String, Value>, field: &str) -> Result<String> {
    match object.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::InvalidEnvelope(format!("`{field}` must be a string"))),
        None => Err(Error::InvalidEnvelope(format!("missing `{field}`"))),
    }
}

/// Serializes a response envelope.
pub fn encode(response: &Response) -> Result<String> {
    serde_json::to_string(response).map_err(Error::Encode)
}

/// Serializes a global-channel message.
pub fn encode_emission(emission: &Emission) -> Result<String> {
    serde_json::to_string(emission).map_err(Error::Encode)
}
