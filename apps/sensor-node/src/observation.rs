use crate::error::{ConfigError, MessageError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const OBSERVATION_TYPE: &str = "observation";

/// One measurement cycle: the request templates sent to a sensor, the values
/// extracted from its answers and the receiver chain the result travels
/// along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub name: String,
    #[serde(rename = "type", default = "observation_type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sensor_name: String,
    #[serde(default)]
    pub sensor_type: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub onetime: bool,
    #[serde(default)]
    pub port_name: String,
    #[serde(default)]
    pub passive_mode: bool,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub next_receiver: usize,
    #[serde(default)]
    pub requests_order: Vec<String>,
    #[serde(default)]
    pub request_sets: BTreeMap<String, RequestSet>,
    #[serde(default)]
    pub response_sets: BTreeMap<String, ResponseSet>,
    #[serde(default)]
    pub sleep_time: f64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSet {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub response_delimiter: String,
    #[serde(default)]
    pub response_pattern: String,
    #[serde(default)]
    pub sleep_time: f64,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSet {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Float,
    Integer,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ResponseValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResponseValue::Integer(v) => Some(*v as f64),
            ResponseValue::Float(v) => Some(*v),
            ResponseValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ResponseValue::Integer(v) => Some(*v),
            ResponseValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseValue::Integer(v) => write!(f, "{v}"),
            ResponseValue::Float(v) => write!(f, "{v}"),
            ResponseValue::Text(v) => f.write_str(v),
        }
    }
}

/// Where an observation goes after the current holder is done with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Hop {
    Forward {
        target: String,
        observation: Observation,
    },
    Finished(Observation),
}

/// Values stamped onto every instance fired by a scheduler.
#[derive(Debug, Clone, Default)]
pub struct InstanceContext {
    pub port_name: String,
    pub sensor_name: String,
    pub node_id: String,
    pub project_id: String,
}

fn observation_type() -> String {
    OBSERVATION_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> f64 {
    1.0
}

impl Observation {
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if self.next_receiver > self.receivers.len() {
            return Err(ConfigError::ReceiverOutOfRange {
                index: self.next_receiver,
                len: self.receivers.len(),
            });
        }
        for name in &self.requests_order {
            let Some(set) = self.request_sets.get(name) else {
                return Err(ConfigError::UnknownRequestSet(name.clone()));
            };
            if set.timeout < 0.0 || !set.timeout.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field: "timeout",
                    reason: format!("{} is not a valid number of seconds", set.timeout),
                });
            }
            if !set.response_pattern.is_empty() {
                Regex::new(&set.response_pattern).map_err(|source| {
                    ConfigError::InvalidPattern {
                        name: name.clone(),
                        source,
                    }
                })?;
            }
        }
        if self.sleep_time < 0.0 || !self.sleep_time.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "sleepTime",
                reason: format!("{} is not a valid number of seconds", self.sleep_time),
            });
        }
        Ok(())
    }

    /// Builds a fresh instance from a configured template.
    pub fn instantiate(&self, ctx: &InstanceContext) -> Observation {
        let mut obs = self.renew();
        obs.port_name = ctx.port_name.clone();
        obs.sensor_name = ctx.sensor_name.clone();
        obs.node_id = ctx.node_id.clone();
        obs.project_id = ctx.project_id.clone();
        if obs.receivers.first() != Some(&ctx.port_name) {
            obs.receivers.insert(0, ctx.port_name.clone());
        }
        obs
    }

    /// Copy with a new id, an empty cursor and no captured results. Routing
    /// and identity fields are kept.
    pub fn renew(&self) -> Observation {
        let mut obs = self.clone();
        obs.kind = observation_type();
        obs.id = Self::new_id();
        obs.timestamp = None;
        obs.next_receiver = 0;
        obs.attempts = 0;
        obs.corrupted = false;
        obs.clear_results();
        obs
    }

    pub fn current_receiver(&self) -> Option<&str> {
        self.receivers.get(self.next_receiver).map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.next_receiver >= self.receivers.len()
    }

    /// Moves the cursor one receiver along the chain. The cursor never goes
    /// past `receivers.len()`.
    pub fn advance(mut self) -> Hop {
        let len = self.receivers.len();
        let next = (self.next_receiver + 1).min(len);
        self.next_receiver = next;
        match self.receivers.get(next).cloned() {
            Some(target) => Hop::Forward {
                target,
                observation: self,
            },
            None => Hop::Finished(self),
        }
    }

    /// Rewinds the chain to the port so the whole cycle runs again.
    pub fn restart(mut self) -> Hop {
        self.next_receiver = 0;
        self.timestamp = None;
        self.clear_results();
        match self.receivers.first().cloned() {
            Some(target) => Hop::Forward {
                target,
                observation: self,
            },
            None => Hop::Finished(self),
        }
    }

    pub fn response_value(&self, name: &str) -> Option<&ResponseValue> {
        self.response_sets.get(name).and_then(|set| set.value.as_ref())
    }

    pub fn set_response_value(&mut self, name: &str, value: ResponseValue) -> bool {
        match self.response_sets.get_mut(name) {
            Some(set) => {
                set.value = Some(value);
                true
            }
            None => false,
        }
    }

    /// Decodes backslash escapes in request templates and delimiters.
    pub fn decode_escapes(&mut self) {
        for set in self.request_sets.values_mut() {
            set.request = unescape(&set.request);
            set.response_delimiter = unescape(&set.response_delimiter);
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, MessageError> {
        let obs: Observation = serde_json::from_str(raw)?;
        if obs.kind != OBSERVATION_TYPE {
            return Err(MessageError::InvalidEnvelope);
        }
        Ok(obs)
    }

    fn clear_results(&mut self) {
        for set in self.request_sets.values_mut() {
            set.response = None;
        }
        for set in self.response_sets.values_mut() {
            set.value = None;
        }
    }
}

impl RequestSet {
    pub fn timeout(&self) -> std::time::Duration {
        secs(self.timeout)
    }

    pub fn sleep(&self) -> std::time::Duration {
        secs(self.sleep_time)
    }
}

pub(crate) fn secs(value: f64) -> std::time::Duration {
    if value.is_finite() && value > 0.0 {
        std::time::Duration::from_secs_f64(value)
    } else {
        std::time::Duration::ZERO
    }
}

/// Replaces `\r`, `\n`, `\t`, `\0`, `\\`, quotes and `\xNN` sequences with
/// the characters they stand for. Unknown sequences are kept as written.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('0') => {
                chars.next();
                out.push('\0');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some(q @ ('"' | '\'')) => {
                chars.next();
                out.push(q);
            }
            Some('x') => {
                let mut lookahead = chars.clone();
                lookahead.next();
                let hex: String = lookahead.by_ref().take(2).collect();
                match (hex.len() == 2)
                    .then(|| u8::from_str_radix(&hex, 16).ok())
                    .flatten()
                {
                    Some(byte) => {
                        out.push(char::from(byte));
                        chars = lookahead;
                    }
                    None => out.push('\\'),
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}
