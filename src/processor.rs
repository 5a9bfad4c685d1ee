//! Stateful reprocessing of raw lines into typed lines.
//!
//! The remote protocol sends a channel's definition inline: after a `Start`
//! line for an exchange, the first message line of every channel is that
//! channel's field -> type map rather than a message. [`LineProcessor`] keeps
//! those definitions per exchange and uses them to coerce every following
//! message. One processor belongs to exactly one replay session.
use crate::error::DecodeError;
use crate::line::{Definition, FieldType, LineType, Message, RawLine, TypedLine};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LineProcessor {
    // exchange -> channel -> definition
    defs: HashMap<String, HashMap<String, Arc<Definition>>>,
}

impl LineProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one raw line.
    ///
    /// Returns `Ok(None)` when the line was consumed as a channel definition
    /// and must not be shown to the caller.
    pub fn process(&mut self, line: RawLine) -> Result<Option<TypedLine>, DecodeError> {
        match line.line_type {
            LineType::Message => self.process_message(line),
            LineType::Start => {
                if self.defs.remove(&line.exchange).is_some() {
                    debug!(exchange = %line.exchange, "schema reset");
                }
                Ok(Some(passthrough(line)))
            }
            LineType::Send | LineType::End | LineType::Error => Ok(Some(passthrough(line))),
        }
    }

    /// Number of channel definitions currently known for `exchange`.
    pub fn definitions(&self, exchange: &str) -> usize {
        self.defs.get(exchange).map_or(0, HashMap::len)
    }

    fn process_message(&mut self, line: RawLine) -> Result<Option<TypedLine>, DecodeError> {
        let RawLine { exchange, line_type, timestamp, channel, message } = line;
        let Some(channel) = channel else {
            return Err(DecodeError::MissingChannel { exchange });
        };

        let channels = self.defs.entry(exchange.clone()).or_default();
        let def = match channels.get(&channel) {
            Some(def) => Arc::clone(def),
            None => {
                let def: Definition =
                    serde_json::from_slice(&message).map_err(|source| DecodeError::Definition {
                        exchange: exchange.clone(),
                        channel: channel.clone(),
                        source,
                    })?;
                debug!(exchange = %exchange, channel = %channel, fields = def.len(), "definition installed");
                channels.insert(channel, Arc::new(def));
                return Ok(None);
            }
        };

        let mut fields: Map<String, Value> =
            serde_json::from_slice(&message).map_err(|source| DecodeError::Message {
                exchange: exchange.clone(),
                channel: channel.clone(),
                source,
            })?;
        for (name, field_type) in def.iter() {
            if let Some(value) = fields.get_mut(name) {
                if !value.is_null() {
                    coerce(name, field_type, value)?;
                }
            }
        }

        Ok(Some(TypedLine {
            exchange,
            line_type,
            timestamp,
            channel: Some(channel),
            message: Message::Fields(fields),
            definition: Some(def),
        }))
    }
}

fn passthrough(line: RawLine) -> TypedLine {
    TypedLine {
        exchange: line.exchange,
        line_type: line.line_type,
        timestamp: line.timestamp,
        channel: line.channel,
        message: Message::Raw(line.message),
        definition: None,
    }
}

/// Rewrite `value` in place according to `field_type`.
fn coerce(name: &str, field_type: &FieldType, value: &mut Value) -> Result<(), DecodeError> {
    let fail = |reason: String| DecodeError::Coercion {
        field: name.to_string(),
        field_type: field_type.to_string(),
        reason,
    };
    match field_type {
        FieldType::Timestamp | FieldType::Duration => {
            let n = match value {
                Value::String(s) => s
                    .parse::<i64>()
                    .map_err(|e| fail(format!("{s:?} is not a decimal integer: {e}")))?,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| fail(format!("{n} is not a 64-bit integer")))?,
                other => return Err(fail(format!("expected a decimal string, got {other}"))),
            };
            *value = Value::from(n);
        }
        FieldType::Int => {
            let Value::Number(n) = value else {
                return Err(fail(format!("expected a number, got {value}")));
            };
            let n = match n.as_i64() {
                Some(i) => i,
                None => {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
                    if !(f >= i64::MIN as f64 && f < i64::MAX as f64) {
                        return Err(fail(format!("{n} does not fit in 64 bits")));
                    }
                    f.trunc() as i64
                }
            };
            *value = Value::from(n);
        }
        FieldType::Other(_) => {}
    }
    Ok(())
}
