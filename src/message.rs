use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::rabbitmq::errors::{RabbitMQError, Result};

/// Content type every envelope is published with. Deliveries declaring
/// anything else are rejected before decoding.
pub const JSON_CONTENT_TYPE: &str = "application/json";

static NULL: Value = Value::Null;

/// Error value carried across a process boundary inside an envelope.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Optional structured fields attached by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            info: None,
            cause: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Serializes any error and its source chain.
    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        let mut chain: Vec<&(dyn StdError + 'static)> = Vec::new();
        let mut source = err.source();
        while let Some(next) = source {
            chain.push(next);
            source = next.source();
        }

        let mut serialized = Self::new("Error", err.to_string());
        serialized.stack = Some(render_stack("Error", &err.to_string(), &chain));
        serialized.cause = nest_causes(&chain);
        serialized
    }

    /// Serializes an `anyhow::Error`, keeping the name of errors that were
    /// themselves deserialized from an envelope or raised by this crate.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(remote) = err.downcast_ref::<SerializedError>() {
            return remote.clone();
        }

        let name = err
            .downcast_ref::<RabbitMQError>()
            .map(|e| e.name())
            .unwrap_or("Error");
        let chain: Vec<&(dyn StdError + 'static)> = err.chain().skip(1).collect();

        let mut serialized = Self::new(name, err.to_string());
        serialized.stack = Some(render_stack(name, &err.to_string(), &chain));
        serialized.cause = nest_causes(&chain);
        serialized
    }

    fn is_well_formed(&self) -> bool {
        !self.name.is_empty() && !self.message.is_empty()
    }
}

fn render_stack(name: &str, message: &str, chain: &[&(dyn StdError + 'static)]) -> String {
    let mut stack = format!("{}: {}", name, message);
    for cause in chain {
        stack.push_str("\n    caused by: ");
        stack.push_str(&cause.to_string());
    }
    stack
}

fn nest_causes(chain: &[&(dyn StdError + 'static)]) -> Option<Box<SerializedError>> {
    chain.iter().rev().fold(None, |inner, cause| {
        let mut serialized = SerializedError::new("Error", cause.to_string());
        serialized.cause = inner;
        Some(Box::new(serialized))
    })
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl StdError for SerializedError {}

/// The wire envelope. Exactly one of the two shapes is meaningful, so the
/// discriminant is the variant itself rather than the shape of `data`.
///
/// On the wire this is `{"data": v}` or `{"data": null, "error": {..}}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(into = "Envelope")]
pub enum MessagePayload {
    Data(Value),
    Error(SerializedError),
}

#[derive(Serialize)]
struct Envelope {
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<SerializedError>,
}

impl From<MessagePayload> for Envelope {
    fn from(payload: MessagePayload) -> Self {
        match payload {
            MessagePayload::Data(data) => Envelope { data, error: None },
            MessagePayload::Error(error) => Envelope {
                data: Value::Null,
                error: Some(error),
            },
        }
    }
}

impl<'de> Deserialize<'de> for MessagePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        payload_from_value(value).map_err(serde::de::Error::custom)
    }
}

fn payload_from_value(value: Value) -> std::result::Result<MessagePayload, String> {
    validate_envelope(&value)?;

    let Value::Object(mut map) = value else {
        return Err("payload must be an object".to_string());
    };

    match map.remove("error") {
        Some(Value::Null) | None => Ok(MessagePayload::Data(
            map.remove("data").unwrap_or(Value::Null),
        )),
        Some(error) => serde_json::from_value(error)
            .map(MessagePayload::Error)
            .map_err(|e| format!("malformed error object: {}", e)),
    }
}

impl Default for MessagePayload {
    fn default() -> Self {
        MessagePayload::Data(Value::Null)
    }
}

impl MessagePayload {
    /// Success envelope around `value`; `None` yields `{data: null}`.
    pub fn make(value: Option<Value>) -> Self {
        MessagePayload::Data(value.unwrap_or(Value::Null))
    }

    pub fn ok(value: impl Into<Value>) -> Self {
        MessagePayload::Data(value.into())
    }

    pub fn err(error: SerializedError) -> Self {
        MessagePayload::Error(error)
    }

    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        MessagePayload::Error(SerializedError::from_error(err))
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        MessagePayload::Error(SerializedError::from_anyhow(err))
    }

    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(MessagePayload::Data(serde_json::to_value(value)?))
    }

    /// Builds a payload from untyped JSON, enforcing the envelope shape.
    pub fn from_value(value: Value) -> Result<Self> {
        payload_from_value(value).map_err(RabbitMQError::InvalidPayload)
    }

    pub fn to_value(&self) -> Value {
        match self {
            MessagePayload::Data(data) => {
                let mut map = Map::new();
                map.insert("data".into(), data.clone());
                Value::Object(map)
            }
            MessagePayload::Error(error) => {
                let mut map = Map::new();
                map.insert("data".into(), Value::Null);
                map.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
                Value::Object(map)
            }
        }
    }

    /// `data` of the envelope; always null for error envelopes.
    pub fn data(&self) -> &Value {
        match self {
            MessagePayload::Data(data) => data,
            MessagePayload::Error(_) => &NULL,
        }
    }

    pub fn error(&self) -> Option<&SerializedError> {
        match self {
            MessagePayload::Data(_) => None,
            MessagePayload::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, MessagePayload::Error(_))
    }

    pub fn into_result(self) -> std::result::Result<Value, SerializedError> {
        match self {
            MessagePayload::Data(data) => Ok(data),
            MessagePayload::Error(error) => Err(error),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            MessagePayload::Error(error) if !error.is_well_formed() => {
                Err(RabbitMQError::InvalidPayload(
                    "error envelopes need a non-empty name and message".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        MessagePayload::from_value(value)
    }
}

/// Checks that `value` has the envelope shape: an object with `data` and at
/// most one other key, `error`, which is null or a well-formed error object.
pub fn validate_envelope(value: &Value) -> std::result::Result<(), String> {
    let Value::Object(map) = value else {
        return Err("payload must be a JSON object".to_string());
    };

    if map.is_empty() || map.len() > 2 {
        return Err(format!("payload must have 1 or 2 keys, found {}", map.len()));
    }
    if !map.contains_key("data") {
        return Err("payload is missing `data`".to_string());
    }
    if map.len() == 2 && !map.contains_key("error") {
        return Err("the only key allowed besides `data` is `error`".to_string());
    }

    match map.get("error") {
        None | Some(Value::Null) => Ok(()),
        Some(error) if is_error_object(error) => Ok(()),
        Some(_) => Err("`error` must carry a name and a message".to_string()),
    }
}

fn is_error_object(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    let non_empty = |key: &str| matches!(map.get(key), Some(Value::String(s)) if !s.is_empty());
    let stack_ok = matches!(map.get("stack"), None | Some(Value::Null) | Some(Value::String(_)));

    non_empty("name") && non_empty("message") && stack_ok
}
