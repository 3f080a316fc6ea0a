use crate::dispatch::{Disposition, Handler};
use crate::error::ConfigError;
use crate::intercom::Intercom;
use crate::message::Message;
use crate::observation::Observation;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    #[default]
    None,
    Daily,
    Monthly,
    Yearly,
}

impl FileRotation {
    fn date_format(self) -> Option<&'static str> {
        match self {
            FileRotation::None => None,
            FileRotation::Daily => Some("%Y-%m-%d"),
            FileRotation::Monthly => Some("%Y-%m"),
            FileRotation::Yearly => Some("%Y"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileExporterConfig {
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_extension")]
    pub file_extension: String,
    #[serde(default)]
    pub file_rotation: FileRotation,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_date_time_format")]
    pub date_time_format: String,
    #[serde(default)]
    pub save_observation_id: bool,
}

fn default_file_name() -> String {
    "{{port}}_{{target}}_{{date}}".to_string()
}

fn default_extension() -> String {
    ".csv".to_string()
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_date_time_format() -> String {
    "%Y-%m-%dT%H:%M:%S%.6f".to_string()
}

impl FileExporterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.is_empty() {
            return Err(ConfigError::MissingField("paths"));
        }
        if self.file_name.trim().is_empty() {
            return Err(ConfigError::MissingField("fileName"));
        }
        if self.separator.is_empty() {
            return Err(ConfigError::MissingField("separator"));
        }
        Ok(())
    }
}

/// Appends one CSV line per observation to files in each configured
/// directory.
pub struct FileExporter {
    name: String,
    config: FileExporterConfig,
}

impl FileExporter {
    pub fn new(name: impl Into<String>, config: FileExporterConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn file_name(&self, obs: &Observation, at: DateTime<Utc>) -> String {
        let date = self
            .config
            .file_rotation
            .date_format()
            .map(|fmt| at.format(fmt).to_string())
            .unwrap_or_default();
        let stem = self
            .config
            .file_name
            .replace("{{port}}", &obs.port_name)
            .replace("{{date}}", &date)
            .replace("{{target}}", &obs.target)
            .replace("{{name}}", &obs.name);
        let stem = stem.trim_end_matches(['_', '-']).to_string();
        format!("{}{}", sanitize(&stem), self.config.file_extension)
    }

    pub fn header(obs: &Observation) -> String {
        format!(
            "# Target \"{}\" of \"{}\" on \"{}\"\n",
            obs.target, obs.sensor_name, obs.port_name
        )
    }

    pub fn line(&self, obs: &Observation, at: DateTime<Utc>) -> String {
        let mut fields = vec![at.format(&self.config.date_time_format).to_string()];
        if self.config.save_observation_id {
            fields.push(obs.id.clone());
        }
        fields.push(obs.target.clone());
        for (name, set) in &obs.response_sets {
            fields.push(name.clone());
            fields.push(set.value.as_ref().map(ToString::to_string).unwrap_or_default());
            fields.push(set.unit.clone());
        }
        let mut line = fields.join(&self.config.separator);
        line.push('\n');
        line
    }

    fn write_all(&self, obs: &Observation) -> Result<usize> {
        let at = obs.timestamp.unwrap_or_else(Utc::now);
        let file_name = self.file_name(obs, at);
        let line = self.line(obs, at);
        let mut written = 0;
        for dir in &self.config.paths {
            if !dir.is_dir() {
                tracing::error!(module = %self.name, path = %dir.display(), "export path does not exist");
                continue;
            }
            let path = dir.join(&file_name);
            match append(&path, &Self::header(obs), &line) {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::error!(module = %self.name, path = %path.display(), error = %err, "failed to write export file");
                }
            }
        }
        Ok(written)
    }
}

fn append(path: &Path, header: &str, line: &str) -> Result<()> {
    let is_new = !path.exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if is_new {
        file.write_all(header.as_bytes())?;
    }
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn sanitize(stem: &str) -> String {
    stem.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[async_trait]
impl Handler for FileExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        let exporter = FileExporter::new(self.name.clone(), self.config.clone());
        let (obs, written) = tokio::task::spawn_blocking(move || {
            let written = exporter.write_all(&obs);
            (obs, written)
        })
        .await?;
        let written = written?;
        tracing::debug!(module = %self.name, id = %obs.id, files = written, "observation exported");
        Ok(Disposition::Forward(obs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimePublisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub receivers: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Sends a copy of every observation to `<receiver>/<target>` topics for
/// live displays.
pub struct RealTimePublisher {
    name: String,
    config: RealTimePublisherConfig,
    bus: Intercom,
}

impl RealTimePublisher {
    pub fn new(name: impl Into<String>, config: RealTimePublisherConfig, bus: Intercom) -> Self {
        Self {
            name: name.into(),
            config,
            bus,
        }
    }

    pub fn copies(&self, obs: &Observation) -> Vec<(String, Observation)> {
        self.config
            .receivers
            .iter()
            .map(|receiver| {
                let topic = format!("{}/{}", receiver, obs.target);
                let mut copy = obs.clone();
                copy.receivers = vec![topic.clone()];
                copy.next_receiver = 0;
                (topic, copy)
            })
            .collect()
    }
}

#[async_trait]
impl Handler for RealTimePublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        if self.config.enabled {
            for (topic, copy) in self.copies(&obs) {
                self.bus.publish(&topic, Message::observation(copy));
            }
        }
        Ok(Disposition::Forward(obs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ResponseValue;
    use chrono::TimeZone;
    use serde_json::json;

    fn obs() -> Observation {
        let mut obs: Observation = serde_json::from_value(json!({
            "name": "getValues",
            "type": "observation",
            "id": "0123456789abcdef0123456789abcdef",
            "target": "ws1",
            "sensorName": "weather",
            "portName": "com1",
            "receivers": ["com1", "preProcessor", "fileExporter"],
            "nextReceiver": 2,
            "responseSets": {
                "temperature": {"type": "float", "unit": "C"},
                "pressure": {"type": "float", "unit": "mbar"}
            }
        }))
        .expect("obs");
        obs.set_response_value("temperature", ResponseValue::Float(23.1));
        obs.set_response_value("pressure", ResponseValue::Float(1011.3));
        obs.timestamp = Some(Utc.with_ymd_and_hms(2024, 3, 7, 12, 30, 0).unwrap());
        obs
    }

    fn exporter(paths: Vec<PathBuf>, extra: serde_json::Value) -> FileExporter {
        let mut config = json!({ "paths": paths });
        if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        FileExporter::new(
            "fileExporter",
            serde_json::from_value(config).expect("config"),
        )
    }

    #[test]
    fn file_name_follows_template_and_rotation() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 0, 0, 0).unwrap();
        let daily = exporter(vec![], json!({"fileRotation": "daily"}));
        assert_eq!(daily.file_name(&obs(), at), "com1_ws1_2024-03-07.csv");
        let monthly = exporter(vec![], json!({"fileRotation": "monthly"}));
        assert_eq!(monthly.file_name(&obs(), at), "com1_ws1_2024-03.csv");
        let none = exporter(vec![], json!({}));
        assert_eq!(none.file_name(&obs(), at), "com1_ws1.csv");
        let named = exporter(
            vec![],
            json!({"fileName": "{{name}}-{{target}}", "fileExtension": ".txt"}),
        );
        assert_eq!(named.file_name(&obs(), at), "getValues-ws1.txt");
    }

    #[test]
    fn line_lists_response_sets_sorted_by_name() {
        let e = exporter(vec![], json!({"saveObservationId": true}));
        let o = obs();
        let line = e.line(&o, o.timestamp.expect("ts"));
        assert_eq!(
            line,
            "2024-03-07T12:30:00.000000,0123456789abcdef0123456789abcdef,ws1,pressure,1011.3,mbar,temperature,23.1,C\n"
        );
    }

    #[tokio::test]
    async fn writes_header_once_and_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        let e = exporter(
            vec![dir.path().to_path_buf(), missing.clone()],
            json!({"fileRotation": "yearly"}),
        );

        for _ in 0..2 {
            match e.handle_observation(obs()).await.expect("export") {
                Disposition::Forward(out) => assert_eq!(out.next_receiver, 2),
                other => panic!("unexpected {other:?}"),
            }
        }

        let content =
            std::fs::read_to_string(dir.path().join("com1_ws1_2024.csv")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "# Target \"ws1\" of \"weather\" on \"com1\"");
        assert!(lines[1].ends_with("temperature,23.1,C"));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn realtime_publisher_sends_single_hop_copies() {
        let bus = Intercom::new();
        let mut display = bus.subscribe("dashboard/ws1", &[]);
        let publisher = RealTimePublisher::new(
            "realTimePublisher",
            serde_json::from_value(json!({"receivers": ["dashboard"]})).expect("config"),
            bus.clone(),
        );
        let original = obs();
        match publisher
            .handle_observation(original.clone())
            .await
            .expect("publish")
        {
            Disposition::Forward(out) => assert_eq!(out, original),
            other => panic!("unexpected {other:?}"),
        }

        let env = display.recv().await.expect("copy");
        let Message::Observation(copy) = env.message else {
            panic!("expected observation");
        };
        assert_eq!(copy.receivers, vec!["dashboard/ws1"]);
        assert_eq!(copy.next_receiver, 0);
        assert_eq!(copy.id, original.id);
        assert!(matches!(copy.advance(), crate::observation::Hop::Finished(_)));
    }
}
