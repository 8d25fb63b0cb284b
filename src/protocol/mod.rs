//! Wire protocol for the relay
//!
//! Messages are JSON objects, one per line. This module holds:
//! - the wire shapes ([`WireRequest`], [`Response`]) exchanged on the socket
//! - the validated [`Request`] with its tagged [`Payload`]
//! - canonical [`CacheKey`] derivation
//! - the newline-delimited codec in [`codec`]

pub mod codec;
mod operator;

pub use codec::JsonLinesCodec;
pub use operator::{Arity, Operator};

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Caller-chosen identifier echoed back in the response
pub type CorrelationId = String;

/// Request as it appears on the wire.
///
/// Only `id` is part of the envelope; every other field is checked by
/// [`Request::from_wire`] so a bad payload still gets an addressed error reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operands: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Value>,
}

/// Request payload, validated at the decode boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Calc {
        operator: Operator,
        operands: Vec<f64>,
    },
    Text {
        prompt: String,
    },
}

/// A validated request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: CorrelationId,
    pub payload: Payload,
    /// When false, no cache is read or written for this request
    pub use_cache: bool,
}

impl Request {
    pub fn calc(id: impl Into<String>, operator: Operator, operands: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            payload: Payload::Calc { operator, operands },
            use_cache: true,
        }
    }

    pub fn text(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Payload::Text {
                prompt: prompt.into(),
            },
            use_cache: true,
        }
    }

    /// Disable caching for this request
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Validate a wire request into a typed one.
    pub fn from_wire(wire: WireRequest) -> Result<Self, ProtocolError> {
        let kind = match wire.kind {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "kind",
                    reason: format!("expected string, got {}", other),
                })
            }
            None => return Err(ProtocolError::MissingField("kind")),
        };

        let use_cache = match wire.cache {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => flag,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "cache",
                    reason: format!("expected boolean, got {}", other),
                })
            }
        };

        let payload = match kind.as_str() {
            "calc" => {
                let operator = match wire.operator {
                    Some(Value::String(op)) => op.parse::<Operator>()?,
                    Some(other) => {
                        return Err(ProtocolError::InvalidField {
                            field: "operator",
                            reason: format!("expected string, got {}", other),
                        })
                    }
                    None => return Err(ProtocolError::MissingField("operator")),
                };
                let operands = parse_operands(wire.operands)?;
                operator.check_arity(operands.len())?;
                Payload::Calc { operator, operands }
            }
            "text" => match wire.prompt {
                Some(Value::String(prompt)) if prompt.trim().is_empty() => {
                    return Err(ProtocolError::InvalidField {
                        field: "prompt",
                        reason: "must not be empty".to_string(),
                    })
                }
                Some(Value::String(prompt)) => Payload::Text { prompt },
                Some(other) => {
                    return Err(ProtocolError::InvalidField {
                        field: "prompt",
                        reason: format!("expected string, got {}", other),
                    })
                }
                None => return Err(ProtocolError::MissingField("prompt")),
            },
            _ => return Err(ProtocolError::UnknownKind(kind)),
        };

        Ok(Self {
            id: wire.id,
            payload,
            use_cache,
        })
    }

    /// Convert back to the wire shape for forwarding.
    pub fn to_wire(&self) -> WireRequest {
        let mut wire = WireRequest {
            id: self.id.clone(),
            cache: (!self.use_cache).then_some(Value::Bool(false)),
            ..Default::default()
        };
        match &self.payload {
            Payload::Calc { operator, operands } => {
                wire.kind = Some(Value::from("calc"));
                wire.operator = Some(Value::from(operator.name()));
                wire.operands = Some(Value::Array(
                    operands.iter().map(|n| number_value(*n)).collect(),
                ));
            }
            Payload::Text { prompt } => {
                wire.kind = Some(Value::from("text"));
                wire.prompt = Some(Value::from(prompt.as_str()));
            }
        }
        wire
    }

    pub fn cache_key(&self) -> CacheKey {
        self.payload.cache_key()
    }
}

fn parse_operands(value: Option<Value>) -> Result<Vec<f64>, ProtocolError> {
    let items = match value {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "operands",
                reason: format!("expected array of numbers, got {}", other),
            })
        }
        None => return Err(ProtocolError::MissingField("operands")),
    };

    items
        .iter()
        .map(|item| {
            item.as_f64()
                .filter(|n| n.is_finite())
                .ok_or_else(|| ProtocolError::InvalidField {
                    field: "operands",
                    reason: format!("'{}' is not a finite number", item),
                })
        })
        .collect()
}

/// Canonical, formatting-independent key for a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Payload {
    /// Derive the canonical cache key.
    ///
    /// Commutative operators sort their operands; numbers use shortest
    /// round-trip formatting with `-0` folded into `0`. Prompts are verbatim.
    pub fn cache_key(&self) -> CacheKey {
        match self {
            Payload::Calc { operator, operands } => {
                let mut normalized: Vec<f64> = operands
                    .iter()
                    .map(|n| if *n == 0.0 { 0.0 } else { *n })
                    .collect();
                if operator.is_commutative() {
                    normalized.sort_by(|a, b| a.total_cmp(b));
                }
                let rendered: Vec<String> = normalized.iter().map(|n| n.to_string()).collect();
                CacheKey(format!("calc:{}:{}", operator.name(), rendered.join(",")))
            }
            Payload::Text { prompt } => CacheKey(format!("text:{}", prompt)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Where a response's result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Computed,
    ServerCache,
    ProxyCache,
}

/// Response as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: CorrelationId,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub took_ms: Option<u64>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value, source: Source) -> Self {
        Self {
            id: id.into(),
            status: Status::Ok,
            result: Some(result),
            error_message: None,
            source,
            took_ms: None,
        }
    }

    /// Error responses are always tagged `computed`: no cache produced them.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::Error,
            result: None,
            error_message: Some(message.into()),
            source: Source::Computed,
            took_ms: None,
        }
    }

    pub fn with_took_ms(mut self, took_ms: u64) -> Self {
        self.took_ms = Some(took_ms);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// JSON number for a result, integral values rendered without a fraction.
pub fn number_value(n: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0; // 2^53
    if n.fract() == 0.0 && n.abs() <= MAX_EXACT {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
