use crate::error::ConfigError;
use crate::observation::{Observation, OBSERVATION_TYPE};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct SensorConfig {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    observations: Vec<Value>,
}

/// A configured instrument and its observation templates.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub observations: BTreeMap<String, Observation>,
}

/// Read-only set of sensors loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct SensorCatalog {
    sensors: BTreeMap<String, Sensor>,
}

impl SensorCatalog {
    pub fn from_config(raw: &BTreeMap<String, Value>) -> Self {
        let mut sensors = BTreeMap::new();
        for (name, value) in raw {
            let config: SensorConfig = match serde_json::from_value(value.clone()) {
                Ok(config) => config,
                Err(err) => {
                    tracing::error!(sensor = %name, error = %err, "sensor rejected");
                    continue;
                }
            };

            let mut observations = BTreeMap::new();
            for (index, value) in config.observations.into_iter().enumerate() {
                match load_template(name, &config.kind, value) {
                    Ok(obs) => {
                        observations.insert(obs.name.clone(), obs);
                    }
                    Err(err) => {
                        tracing::error!(sensor = %name, observation = index, error = %err, "observation rejected");
                    }
                }
            }

            tracing::debug!(sensor = %name, observations = observations.len(), "sensor loaded");
            sensors.insert(
                name.clone(),
                Sensor {
                    name: name.clone(),
                    kind: config.kind,
                    description: config.description,
                    observations,
                },
            );
        }
        Self { sensors }
    }

    pub fn get(&self, name: &str) -> Option<&Sensor> {
        self.sensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn observation(&self, sensor: &str, name: &str) -> Result<&Observation, ConfigError> {
        self.sensors
            .get(sensor)
            .ok_or_else(|| ConfigError::UnknownSensor(sensor.to_string()))?
            .observations
            .get(name)
            .ok_or_else(|| ConfigError::UnknownObservation {
                sensor: sensor.to_string(),
                observation: name.to_string(),
            })
    }

    /// Drops templates whose receivers cannot be reached.
    pub fn retain_routable(&mut self, is_known: impl Fn(&str) -> bool) {
        for sensor in self.sensors.values_mut() {
            sensor.observations.retain(|name, obs| {
                match obs.receivers.iter().find(|r| !is_known(r.as_str())) {
                    Some(receiver) => {
                        let err = ConfigError::UnknownReceiver(receiver.clone());
                        tracing::error!(sensor = %sensor.name, observation = %name, error = %err, "observation rejected");
                        false
                    }
                    None => true,
                }
            });
        }
    }
}

fn load_template(sensor: &str, kind: &str, value: Value) -> Result<Observation, ConfigError> {
    let mut obs: Observation = serde_json::from_value(value)?;
    obs.kind = OBSERVATION_TYPE.to_string();
    obs.sensor_name = sensor.to_string();
    obs.sensor_type = kind.to_string();
    obs.decode_escapes();
    obs.validate()?;
    Ok(obs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                "totalStation".to_string(),
                json!({
                    "type": "leicaTps1200",
                    "description": "Leica TPS1201",
                    "observations": [
                        {
                            "name": "getDistance",
                            "receivers": ["preProcessor", "fileExporter"],
                            "requestsOrder": ["measure"],
                            "requestSets": {
                                "measure": {
                                    "request": "%R1Q,2008:1,0\\r\\n",
                                    "responseDelimiter": "\\r\\n",
                                    "responsePattern": "(?P<returnCode>\\d+)"
                                }
                            },
                            "responseSets": {"returnCode": {"type": "integer"}}
                        },
                        {"name": "broken", "requestsOrder": ["nope"]},
                        {"description": "no name"}
                    ]
                }),
            ),
            ("garbage".to_string(), json!("not a sensor")),
        ])
    }

    #[test]
    fn loads_templates_and_rejects_bad_ones() {
        let catalog = SensorCatalog::from_config(&raw());
        assert_eq!(catalog.len(), 1);
        let sensor = catalog.get("totalStation").expect("sensor");
        assert_eq!(sensor.observations.len(), 1);

        let obs = catalog
            .observation("totalStation", "getDistance")
            .expect("observation");
        assert_eq!(obs.sensor_name, "totalStation");
        assert_eq!(obs.sensor_type, "leicaTps1200");
        assert_eq!(obs.request_sets["measure"].request, "%R1Q,2008:1,0\r\n");
        assert_eq!(obs.request_sets["measure"].response_delimiter, "\r\n");
    }

    #[test]
    fn lookup_errors_name_the_missing_item() {
        let catalog = SensorCatalog::from_config(&raw());
        assert!(matches!(
            catalog.observation("ghost", "x"),
            Err(ConfigError::UnknownSensor(_))
        ));
        assert!(matches!(
            catalog.observation("totalStation", "broken"),
            Err(ConfigError::UnknownObservation { .. })
        ));
    }

    #[test]
    fn unroutable_templates_are_dropped() {
        let mut catalog = SensorCatalog::from_config(&raw());
        catalog.retain_routable(|name| name == "preProcessor");
        assert!(catalog.observation("totalStation", "getDistance").is_err());

        let mut catalog = SensorCatalog::from_config(&raw());
        catalog.retain_routable(|name| name == "preProcessor" || name == "fileExporter");
        assert!(catalog.observation("totalStation", "getDistance").is_ok());
    }
}
