//! Detection and repair of character-array and double-encoded payloads.

use serde_json::{Map, Value as JsonValue};

use crate::ExtractionError;

const MAX_ENCODING_LAYERS: usize = 3;

/// A decoded payload object next to the payload it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The payload as received, before any unwrapping.
    pub payload: JsonValue,
    pub object: Map<String, JsonValue>,
    pub reconstructed: bool,
}

/// Object whose keys are all non-negative integers and which contains `"0"`.
pub fn is_char_array(map: &Map<String, JsonValue>) -> bool {
    map.contains_key("0")
        && map
            .keys()
            .all(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
}

/// Concatenates the string fragments at `"0"`, `"1"`, ... and fails on gaps or non-string fragments.
pub fn join_fragments(map: &Map<String, JsonValue>) -> Result<String, ExtractionError> {
    let mut text = String::new();
    let mut consumed = 0usize;
    loop {
        match map.get(&consumed.to_string()) {
            Some(JsonValue::String(fragment)) => text.push_str(fragment),
            Some(other) => {
                return Err(ExtractionError::Corrupt {
                    reason: format!("fragment {consumed} is not a string: {other}"),
                })
            }
            None => break,
        }
        consumed += 1;
    }
    if consumed != map.len() {
        return Err(ExtractionError::Corrupt {
            reason: format!(
                "character array has a gap after index {}; {} of {} fragments used",
                consumed.saturating_sub(1),
                consumed,
                map.len()
            ),
        });
    }
    Ok(text)
}

fn parse_embedded(text: &str) -> Result<JsonValue, ExtractionError> {
    serde_json::from_str(text).map_err(|err| ExtractionError::Corrupt {
        reason: format!("reassembled payload is not JSON: {err}"),
    })
}

/// Unwraps the payload until a regular JSON object is reached.
pub fn decode_value(value: JsonValue) -> Result<Decoded, ExtractionError> {
    let payload = value.clone();
    let mut current = value;
    let mut reconstructed = false;
    for _ in 0..=MAX_ENCODING_LAYERS {
        current = match current {
            JsonValue::Object(map) if is_char_array(&map) => {
                reconstructed = true;
                parse_embedded(&join_fragments(&map)?)?
            }
            JsonValue::Object(object) => {
                return Ok(Decoded {
                    payload,
                    object,
                    reconstructed,
                })
            }
            JsonValue::String(text) => {
                reconstructed = true;
                parse_embedded(&text)?
            }
            other => {
                return Err(ExtractionError::UnrecognizedSchema {
                    reason: format!("expected a JSON object, found {}", type_name(&other)),
                })
            }
        };
    }
    Err(ExtractionError::Corrupt {
        reason: format!("payload is encoded more than {MAX_ENCODING_LAYERS} times"),
    })
}

pub fn decode_bytes(bytes: &[u8]) -> Result<Decoded, ExtractionError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|err| ExtractionError::Corrupt {
        reason: format!("payload is not JSON: {err}"),
    })?;
    decode_value(value)
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
