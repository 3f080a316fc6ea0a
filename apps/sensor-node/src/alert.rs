use crate::dispatch::{Disposition, Handler};
use crate::intercom::Intercom;
use crate::message::{Message, Notification, NotificationKind};
use crate::observation::Observation;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Events from this module never become alerts.
const ALERT_TARGET: &str = module_path!();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub dt: DateTime<Utc>,
    pub level: AlertLevel,
    pub source: String,
    pub message: String,
}

/// Fan-out point between the log pipeline and alerter modules.
#[derive(Clone)]
pub struct AlertHub {
    tx: broadcast::Sender<AlertRecord>,
}

impl AlertHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn layer(&self) -> AlertLayer {
        AlertLayer {
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertRecord> {
        self.tx.subscribe()
    }
}

/// `tracing` layer copying WARN and ERROR events into the hub.
pub struct AlertLayer {
    tx: broadcast::Sender<AlertRecord>,
}

#[derive(Default)]
struct AlertVisitor {
    message: String,
    source: Option<String>,
    error: Option<String>,
}

impl AlertVisitor {
    fn record(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            "module" | "port" | "scheduler" if self.source.is_none() => self.source = Some(value),
            "error" => self.error = Some(value),
            _ => {}
        }
    }
}

impl Visit for AlertVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let level = match *meta.level() {
            Level::ERROR => AlertLevel::Error,
            Level::WARN => AlertLevel::Warning,
            _ => return,
        };
        if meta.target().starts_with(ALERT_TARGET) || self.tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = AlertVisitor::default();
        event.record(&mut visitor);
        let message = match visitor.error {
            Some(error) => format!("{}: {}", visitor.message, error),
            None => visitor.message,
        };
        let _ = self.tx.send(AlertRecord {
            dt: Utc::now(),
            level,
            source: visitor
                .source
                .unwrap_or_else(|| meta.target().to_string()),
            message,
        });
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlerterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Agent modules that deliver alerts (mail, SMS, IRC ...).
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub receivers: BTreeMap<AlertLevel, Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Turns log records into `alert` notifications for agent modules.
pub struct Alerter {
    name: String,
    config: AlerterConfig,
    records: Mutex<Option<broadcast::Receiver<AlertRecord>>>,
}

impl Alerter {
    pub fn new(name: impl Into<String>, config: AlerterConfig, hub: &AlertHub) -> Self {
        Self {
            name: name.into(),
            config,
            records: Mutex::new(Some(hub.subscribe())),
        }
    }

    pub fn notifications(&self, record: &AlertRecord) -> Vec<(String, Notification)> {
        let Some(receivers) = self.config.receivers.get(&record.level) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for module in &self.config.modules {
            for receiver in receivers {
                let mut fields = Map::new();
                fields.insert("dt".to_string(), Value::from(record.dt.to_rfc3339()));
                fields.insert("level".to_string(), Value::from(record.level.as_str()));
                fields.insert("name".to_string(), Value::from(record.source.clone()));
                fields.insert("message".to_string(), Value::from(record.message.clone()));
                fields.insert("receiver".to_string(), Value::from(receiver.clone()));
                match Notification::new(NotificationKind::Alert, fields) {
                    Ok(notification) => out.push((module.clone(), notification)),
                    Err(err) => tracing::debug!(error = %err, "alert notification rejected"),
                }
            }
        }
        out
    }
}

#[async_trait]
impl Handler for Alerter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition> {
        Ok(Disposition::Forward(obs))
    }

    async fn run(&self, bus: Intercom, cancel: CancellationToken) {
        let Some(mut records) = self.records.lock().take() else {
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = records.recv() => match received {
                    Ok(record) => {
                        if !self.config.enabled {
                            continue;
                        }
                        for (module, notification) in self.notifications(&record) {
                            bus.publish(&module, Message::Notification(notification));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(module = %self.name, skipped, "alert records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
