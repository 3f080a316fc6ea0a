use crate::dispatch::{Disposition, Handler};
use crate::error::ConfigError;
use crate::observation::{Observation, ResponseType, ResponseValue};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Extracts typed response values from raw sensor responses using the
/// named groups of each request set's `responsePattern`.
pub struct PreProcessor {
    name: String,
    patterns: Mutex<HashMap<String, Regex>>,
}

impl PreProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Mutex::new(HashMap::new()),
        }
    }

    fn pattern(&self, raw: &str) -> std::result::Result<Regex, regex::Error> {
        if let Some(re) = self.patterns.lock().get(raw) {
            return Ok(re.clone());
        }
        let re = Regex::new(raw)?;
        self.patterns.lock().insert(raw.to_string(), re.clone());
        Ok(re)
    }

    pub fn extract(&self, mut obs: Observation) -> Observation {
        for request in obs.requests_order.clone() {
            let Some(set) = obs.request_sets.get(&request) else {
                continue;
            };
            let Some(response) = set.response.clone().filter(|r| !r.is_empty()) else {
                tracing::warn!(
                    module = %self.name,
                    observation = %obs.name,
                    request = %request,
                    "no response to extract values from"
                );
                continue;
            };
            if set.response_pattern.is_empty() {
                continue;
            }
            let re = match self.pattern(&set.response_pattern) {
                Ok(re) => re,
                Err(err) => {
                    tracing::error!(module = %self.name, request = %request, error = %err, "invalid response pattern");
                    continue;
                }
            };
            let Some(captures) = re.captures(&response) else {
                tracing::warn!(
                    module = %self.name,
                    observation = %obs.name,
                    request = %request,
                    response = %response.trim_end(),
                    "response does not match pattern"
                );
                continue;
            };

            let groups: Vec<&str> = re.capture_names().flatten().collect();
            if groups.is_empty() {
                tracing::warn!(module = %self.name, request = %request, "response pattern has no named groups");
                continue;
            }
            for group in groups {
                let Some(raw) = captures.name(group).map(|m| m.as_str()) else {
                    continue;
                };
                let Some(kind) = obs.response_sets.get(group).map(|set| set.kind) else {
                    tracing::warn!(
                        module = %self.name,
                        observation = %obs.name,
                        response = group,
                        "response set is not defined"
                    );
                    continue;
                };
                match parse_value(raw, kind) {
                    Some(value) => {
                        obs.set_response_value(group, value);
                    }
                    None => tracing::warn!(
                        module = %self.name,
                        observation = %obs.name,
                        response = group,
                        value = raw,
                        "response value could not be parsed"
                    ),
                }
            }
        }
        obs
    }
}

fn parse_value(raw: &str, kind: ResponseType) -> Option<ResponseValue> {
    let raw = raw.trim();
    match kind {
        ResponseType::Float => raw
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(ResponseValue::Float),
        ResponseType::Integer => raw
            .trim_start_matches('+')
            .parse::<i64>()
            .ok()
            .map(ResponseValue::Integer),
        ResponseType::String => Some(ResponseValue::Text(raw.to_string())),
    }
}

#[async_trait]
impl Handler for PreProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        Ok(Disposition::Forward(self.extract(obs)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// GeoCOM return codes that are not plain success.
const RETURN_CODES: &[(i64, Severity, bool, &str)] = &[
    (2, Severity::Error, false, "Unknown error, result unspecified"),
    (3, Severity::Warning, false, "Invalid result"),
    (4, Severity::Error, false, "Fatal error"),
    (5, Severity::Error, false, "GeoCOM command unknown (not implemented yet)"),
    (6, Severity::Error, false, "Function execution timed out (result unspecified)"),
    (13, Severity::Error, true, "System busy"),
    (514, Severity::Error, false, "Several targets detected"),
    (1283, Severity::Warning, false, "Measurement without full correction"),
    (1284, Severity::Warning, false, "Accuracy can not be guaranteed"),
    (1285, Severity::Error, true, "Only angle measurement valid"),
    (1288, Severity::Warning, false, "Only angle measurement valid, but without full correction"),
    (1292, Severity::Error, true, "Distance measurement not done (no aim, etc.)"),
    (8704, Severity::Error, true, "Position not reached"),
    (8708, Severity::Error, true, "Position not exactly reached"),
    (8710, Severity::Error, true, "No target detected"),
    (8711, Severity::Error, false, "Multiple targets detected"),
    (8716, Severity::Error, true, "Target position not exactly reached"),
];

pub fn lookup_return_code(code: i64) -> Option<(Severity, bool, &'static str)> {
    RETURN_CODES
        .iter()
        .find(|(c, ..)| *c == code)
        .map(|(_, severity, retry, message)| (*severity, *retry, *message))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnCodeInspectorConfig {
    #[serde(default = "default_return_code_sets")]
    pub response_sets: Vec<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_return_code_sets() -> Vec<String> {
    vec!["returnCode".to_string()]
}

fn default_retries() -> u32 {
    3
}

/// Checks instrument return codes. Retryable codes send the observation back
/// to its port until the retry budget is spent; the rest mark it corrupted.
pub struct ReturnCodeInspector {
    name: String,
    response_sets: Vec<String>,
    retries: u32,
}

impl ReturnCodeInspector {
    pub fn new(name: impl Into<String>, config: ReturnCodeInspectorConfig) -> Self {
        Self {
            name: name.into(),
            response_sets: config.response_sets,
            retries: config.retries,
        }
    }

    pub fn inspect(&self, mut obs: Observation) -> Disposition {
        for set in &self.response_sets {
            let Some(value) = obs.response_value(set) else {
                continue;
            };
            let Some(code) = value.as_i64() else {
                tracing::warn!(module = %self.name, response = %set, "return code is not an integer");
                continue;
            };
            if code == 0 {
                continue;
            }

            let (severity, retry, message) =
                lookup_return_code(code).unwrap_or((Severity::Error, false, "Unknown return code"));

            if retry && obs.attempts < self.retries {
                obs.attempts += 1;
                tracing::warn!(
                    module = %self.name,
                    observation = %obs.name,
                    target = %obs.target,
                    code,
                    attempt = obs.attempts,
                    retries = self.retries,
                    "{message}; retrying measurement"
                );
                return Disposition::Restart(obs);
            }

            match severity {
                Severity::Warning => tracing::warn!(
                    module = %self.name,
                    observation = %obs.name,
                    target = %obs.target,
                    code,
                    "{message}"
                ),
                Severity::Error => {
                    obs.corrupted = true;
                    tracing::error!(
                        module = %self.name,
                        observation = %obs.name,
                        target = %obs.target,
                        code,
                        attempts = obs.attempts,
                        "{message}"
                    );
                }
            }
        }
        Disposition::Forward(obs)
    }
}

#[async_trait]
impl Handler for ReturnCodeInspector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        Ok(self.inspect(obs))
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseValueInspectorConfig {
    /// Observation name to response set name to limits.
    #[serde(default)]
    pub observations: BTreeMap<String, BTreeMap<String, Limits>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LimitCheck {
    Within,
    Missing,
    NotNumeric,
    BelowMin { value: f64, min: f64 },
    AboveMax { value: f64, max: f64 },
}

pub struct ResponseValueInspector {
    name: String,
    config: ResponseValueInspectorConfig,
}

impl ResponseValueInspector {
    pub fn new(name: impl Into<String>, config: ResponseValueInspectorConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn check(value: Option<&ResponseValue>, limits: Limits) -> LimitCheck {
        let Some(value) = value else {
            return LimitCheck::Missing;
        };
        let Some(value) = value.as_f64() else {
            return LimitCheck::NotNumeric;
        };
        if let Some(min) = limits.min {
            if value < min {
                return LimitCheck::BelowMin { value, min };
            }
        }
        if let Some(max) = limits.max {
            if value > max {
                return LimitCheck::AboveMax { value, max };
            }
        }
        LimitCheck::Within
    }

    fn inspect(&self, obs: &Observation) {
        let Some(sets) = self.config.observations.get(&obs.name) else {
            return;
        };
        for (set, limits) in sets {
            match Self::check(obs.response_value(set), *limits) {
                LimitCheck::Within => {}
                LimitCheck::Missing => tracing::debug!(
                    module = %self.name,
                    observation = %obs.name,
                    response = %set,
                    "no value to inspect"
                ),
                LimitCheck::NotNumeric => tracing::warn!(
                    module = %self.name,
                    observation = %obs.name,
                    response = %set,
                    "response value is not a number"
                ),
                LimitCheck::BelowMin { value, min } => tracing::error!(
                    module = %self.name,
                    observation = %obs.name,
                    target = %obs.target,
                    response = %set,
                    value,
                    min,
                    "response value of {} is below minimum", obs.target
                ),
                LimitCheck::AboveMax { value, max } => tracing::error!(
                    module = %self.name,
                    observation = %obs.name,
                    target = %obs.target,
                    response = %set,
                    value,
                    max,
                    "response value of {} is above maximum", obs.target
                ),
            }
        }
    }
}

#[async_trait]
impl Handler for ResponseValueInspector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        self.inspect(&obs);
        Ok(Disposition::Forward(obs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRule {
    pub source_unit: String,
    pub designated_unit: String,
    pub scaling_value: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnitConverterConfig {
    /// Response set name to scaling rule.
    #[serde(default)]
    pub scale: BTreeMap<String, ScaleRule>,
}

impl UnitConverterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in self.scale.values() {
            if !rule.scaling_value.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field: "scalingValue",
                    reason: format!("{} is not a finite number", rule.scaling_value),
                });
            }
        }
        Ok(())
    }
}

/// Multiplies response values by a fixed factor and relabels their unit.
pub struct UnitConverter {
    name: String,
    config: UnitConverterConfig,
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

impl UnitConverter {
    pub fn new(name: impl Into<String>, config: UnitConverterConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn convert(&self, mut obs: Observation) -> Observation {
        for (set_name, rule) in &self.config.scale {
            let Some(set) = obs.response_sets.get_mut(set_name) else {
                continue;
            };
            let Some(value) = set.value.as_ref().and_then(ResponseValue::as_f64) else {
                continue;
            };
            if set.unit != rule.source_unit {
                tracing::warn!(
                    module = %self.name,
                    response = %set_name,
                    unit = %set.unit,
                    expected = %rule.source_unit,
                    "unit mismatch; value not converted"
                );
                continue;
            }
            let scaled = round5(value * rule.scaling_value);
            set.value = Some(ResponseValue::Float(scaled));
            set.kind = ResponseType::Float;
            set.unit = rule.designated_unit.clone();
            tracing::debug!(
                module = %self.name,
                response = %set_name,
                from = value,
                to = scaled,
                "converted response value"
            );
        }
        obs
    }
}

#[async_trait]
impl Handler for UnitConverter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        Ok(Disposition::Forward(self.convert(obs)))
    }
}
