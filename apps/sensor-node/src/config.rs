use crate::schedule::EmptyWeekday;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeSection,
    pub project: ProjectSection,
    pub mqtt: MqttConfig,
    /// Raw module, sensor and scheduler blocks. They are resolved one by one
    /// so a bad entry only rejects itself.
    pub modules: BTreeMap<String, Value>,
    pub sensors: BTreeMap<String, Value>,
    pub schedulers: BTreeMap<String, Value>,
    pub scheduling: SchedulingConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSection {
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            name: String::new(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_url")]
    pub url: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_mqtt_url(),
            topic_prefix: default_topic_prefix(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_seconds: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.url).context("invalid MQTT url")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("MQTT url missing host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);
        Ok((host, port))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
    #[serde(default)]
    pub empty_weekday: EmptyWeekday,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            empty_weekday: EmptyWeekday::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SchedulingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_seconds")]
    pub grace_period_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    node: NodeSection,
    #[serde(default)]
    project: ProjectSection,
    #[serde(default)]
    intercom: IntercomSection,
    #[serde(default)]
    modules: BTreeMap<String, Value>,
    #[serde(default)]
    sensors: BTreeMap<String, Value>,
    #[serde(default)]
    schedulers: BTreeMap<String, Value>,
    #[serde(default)]
    scheduling: SchedulingConfig,
    #[serde(default)]
    shutdown: ShutdownConfig,
}

#[derive(Debug, Default, Deserialize)]
struct IntercomSection {
    #[serde(default)]
    mqtt: MqttConfig,
}

fn default_node_id() -> String {
    "sensor-node".to_string()
}

fn default_mqtt_url() -> String {
    "mqtt://127.0.0.1:1883".to_string()
}

fn default_topic_prefix() -> String {
    "sensor-node".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_grace_seconds() -> u64 {
    10
}

impl Config {
    /// Reads the configuration file and applies `SENSOR_NODE_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_json(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_overrides(env_optional)?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(raw)?;
        if file.node.id.trim().is_empty() {
            return Err(anyhow!("node.id must not be empty"));
        }
        Ok(Self {
            node: file.node,
            project: file.project,
            mqtt: file.intercom.mqtt,
            modules: file.modules,
            sensors: file.sensors,
            schedulers: file.schedulers,
            scheduling: file.scheduling,
            shutdown: file.shutdown,
        })
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("SENSOR_NODE_NODE_ID") {
            self.node.id = id;
        }
        if let Some(id) = lookup("SENSOR_NODE_PROJECT_ID") {
            self.project.id = id;
        }
        if let Some(url) = lookup("SENSOR_NODE_MQTT_URL") {
            self.mqtt.url = url;
            self.mqtt.enabled = true;
        }
        if let Some(username) = lookup("SENSOR_NODE_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("SENSOR_NODE_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(prefix) = lookup("SENSOR_NODE_MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
        if let Some(raw) = lookup("SENSOR_NODE_GRACE_SECONDS") {
            self.shutdown.grace_period_seconds = raw
                .parse::<u64>()
                .context("invalid SENSOR_NODE_GRACE_SECONDS")?;
        }
        if self.mqtt.enabled {
            self.mqtt.endpoint()?;
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_seconds)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
