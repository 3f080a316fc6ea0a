use crate::alert::{AlertHub, Alerter, AlerterConfig};
use crate::dispatch::{Handler, Worker};
use crate::error::ConfigError;
use crate::export::{FileExporter, FileExporterConfig, RealTimePublisher, RealTimePublisherConfig};
use crate::intercom::Intercom;
use crate::port::serial::{SerialPortConfig, SerialSettings, SerialTransport};
use crate::port::tcp::{TcpPortConfig, TcpTransport};
use crate::port::virtual_sensor::{VirtualPortConfig, VirtualTransport};
use crate::port::PortDriver;
use crate::processing::{
    PreProcessor, ResponseValueInspector, ResponseValueInspectorConfig, ReturnCodeInspector,
    ReturnCodeInspectorConfig, UnitConverter, UnitConverterConfig,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Module kinds that can be named in `modules.<name>.kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModuleSpec {
    SerialPort(SerialPortConfig),
    TcpPort(TcpPortConfig),
    VirtualPort(VirtualPortConfig),
    PreProcessor,
    ReturnCodeInspector(ReturnCodeInspectorConfig),
    ResponseValueInspector(ResponseValueInspectorConfig),
    UnitConverter(UnitConverterConfig),
    FileExporter(FileExporterConfig),
    RealTimePublisher(RealTimePublisherConfig),
    Alerter(AlerterConfig),
}

pub enum Module {
    Handler(Arc<dyn Handler>),
    Port(PortDriver),
}

/// What module constructors may need besides their own config.
pub struct BuildContext {
    pub bus: Intercom,
    pub alerts: Option<AlertHub>,
}

impl ModuleSpec {
    pub fn build(self, name: &str, ctx: &BuildContext) -> Result<Module, ConfigError> {
        let module = match self {
            ModuleSpec::SerialPort(config) => {
                let settings = SerialSettings::from_config(&config)?;
                Module::Port(PortDriver::new(
                    name,
                    Box::new(SerialTransport::new(settings)),
                    config.max_attempts,
                ))
            }
            ModuleSpec::TcpPort(config) => {
                config.validate()?;
                Module::Port(PortDriver::new(
                    name,
                    Box::new(TcpTransport::new(&config)),
                    config.max_attempts,
                ))
            }
            ModuleSpec::VirtualPort(config) => {
                let (transport, _handle) = VirtualTransport::new(name, &config)?;
                Module::Port(PortDriver::new(name, Box::new(transport), config.max_attempts))
            }
            ModuleSpec::PreProcessor => Module::Handler(Arc::new(PreProcessor::new(name))),
            ModuleSpec::ReturnCodeInspector(config) => {
                Module::Handler(Arc::new(ReturnCodeInspector::new(name, config)))
            }
            ModuleSpec::ResponseValueInspector(config) => {
                Module::Handler(Arc::new(ResponseValueInspector::new(name, config)))
            }
            ModuleSpec::UnitConverter(config) => {
                config.validate()?;
                Module::Handler(Arc::new(UnitConverter::new(name, config)))
            }
            ModuleSpec::FileExporter(config) => {
                config.validate()?;
                Module::Handler(Arc::new(FileExporter::new(name, config)))
            }
            ModuleSpec::RealTimePublisher(config) => Module::Handler(Arc::new(
                RealTimePublisher::new(name, config, ctx.bus.clone()),
            )),
            ModuleSpec::Alerter(config) => {
                let hub = ctx.alerts.as_ref().ok_or(ConfigError::InvalidValue {
                    field: "kind",
                    reason: "alerting is not available in this process".to_string(),
                })?;
                Module::Handler(Arc::new(Alerter::new(name, config, hub)))
            }
        };
        Ok(module)
    }
}

/// Handles of the tasks started by [`Registry::start`].
pub struct RunningModules {
    pub workers: Vec<JoinHandle<()>>,
    pub ports: Vec<JoinHandle<()>>,
}

/// Every module instance of the node, built once at startup.
#[derive(Default)]
pub struct Registry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
    ports: BTreeMap<String, PortDriver>,
}

impl Registry {
    /// Builds all configured modules. Invalid entries are logged and left
    /// out; the rest of the node still starts.
    pub fn from_config(raw: &BTreeMap<String, Value>, ctx: &BuildContext) -> Self {
        let mut registry = Self::default();
        for (name, value) in raw {
            let built = serde_json::from_value::<ModuleSpec>(value.clone())
                .map_err(ConfigError::from)
                .and_then(|spec| spec.build(name, ctx));
            match built {
                Ok(module) => registry.insert(name, module),
                Err(err) => {
                    tracing::error!(module = %name, error = %err, "module rejected");
                }
            }
        }
        tracing::info!(
            handlers = registry.handlers.len(),
            ports = registry.ports.len(),
            "modules loaded"
        );
        registry
    }

    pub fn insert(&mut self, name: &str, module: Module) {
        match module {
            Module::Handler(handler) => {
                self.handlers.insert(name.to_string(), handler);
            }
            Module::Port(port) => {
                self.ports.insert(name.to_string(), port);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name) || self.ports.contains_key(name)
    }

    pub fn is_port(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.ports
            .keys()
            .chain(self.handlers.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes every module before spawning any, so nothing published
    /// during startup is lost.
    pub fn start(
        self,
        bus: &Intercom,
        workers_cancel: &CancellationToken,
        ports_cancel: &CancellationToken,
    ) -> RunningModules {
        let workers: Vec<_> = self
            .handlers
            .into_values()
            .map(|handler| {
                let worker = Worker::new(handler, bus.clone());
                let subscription = worker.subscribe();
                (worker, subscription)
            })
            .collect();
        let ports: Vec<_> = self
            .ports
            .into_values()
            .map(|port| {
                let subscription = bus.subscribe(port.name(), &[]);
                (port, subscription)
            })
            .collect();

        RunningModules {
            workers: workers
                .into_iter()
                .map(|(worker, sub)| worker.start(sub, workers_cancel.child_token()))
                .collect(),
            ports: ports
                .into_iter()
                .map(|(port, sub)| port.start(bus.clone(), sub, ports_cancel.child_token()))
                .collect(),
        }
    }
}
