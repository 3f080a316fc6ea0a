use super::{FrameBuffer, Transport};
use crate::error::{ConfigError, PortError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const READ_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub rtscts: bool,
    #[serde(default)]
    pub xonxoff: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_byte_size() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    path: String,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    flow_control: FlowControl,
}

impl SerialSettings {
    pub fn from_config(config: &SerialPortConfig) -> Result<Self, ConfigError> {
        if config.port.trim().is_empty() {
            return Err(ConfigError::MissingField("port"));
        }
        let data_bits = match config.byte_size {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "byteSize",
                    reason: format!("{other} is not between 5 and 8"),
                })
            }
        };
        let parity = match config.parity.to_lowercase().as_str() {
            "none" | "n" => Parity::None,
            "even" | "e" => Parity::Even,
            "odd" | "o" => Parity::Odd,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "parity",
                    reason: format!("unknown parity `{other}`"),
                })
            }
        };
        let stop_bits = match config.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "stopBits",
                    reason: format!("{other} is not 1 or 2"),
                })
            }
        };
        let flow_control = match (config.rtscts, config.xonxoff) {
            (true, _) => FlowControl::Hardware,
            (false, true) => FlowControl::Software,
            (false, false) => FlowControl::None,
        };
        Ok(Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }
}

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// RS-232/USB serial line. Blocking serial I/O runs on the blocking pool;
/// received bytes land in a shared buffer so an abandoned read loses
/// nothing.
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<SharedPort>,
    buffer: Arc<Mutex<FrameBuffer>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            buffer: Arc::new(Mutex::new(FrameBuffer::default())),
        }
    }
}

fn blocking_failed(err: tokio::task::JoinError) -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, err.to_string())
}

#[async_trait]
impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("serial:{}@{}", self.settings.path, self.settings.baud_rate)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self) -> Result<(), PortError> {
        let settings = self.settings.clone();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(settings.path.as_str(), settings.baud_rate)
                .data_bits(settings.data_bits)
                .parity(settings.parity)
                .stop_bits(settings.stop_bits)
                .flow_control(settings.flow_control)
                .timeout(READ_SLICE)
                .open()
        })
        .await
        .map_err(|err| PortError::Open {
            target: self.describe(),
            reason: err.to_string(),
        })?;
        let port = opened.map_err(|err| PortError::Open {
            target: self.describe(),
            reason: err.to_string(),
        })?;
        self.buffer.lock().clear();
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        let port = self.port.clone().ok_or(PortError::NotOpen)?;
        let buffer = self.buffer.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut port = port.lock();
            discard_stale_input(&mut **port, &buffer);
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(|err| PortError::Write(blocking_failed(err)))?
        .map_err(PortError::Write)
    }

    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, PortError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.buffer.lock().take_frame(delimiter) {
                return Ok(Some(frame));
            }
            let port = self.port.clone().ok_or(PortError::NotOpen)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(READ_SLICE);
            let buffer = self.buffer.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let mut port = port.lock();
                port.set_timeout(slice).map_err(std::io::Error::from)?;
                let mut chunk = [0u8; 256];
                match port.read(&mut chunk) {
                    Ok(n) => {
                        buffer.lock().extend(&chunk[..n]);
                        Ok(())
                    }
                    Err(err) if err.kind() == ErrorKind::TimedOut => Ok(()),
                    Err(err) => Err(err),
                }
            })
            .await
            .map_err(|err| PortError::Read(blocking_failed(err)))?
            .map_err(PortError::Read)?;
        }
    }

    async fn close(&mut self) {
        self.port = None;
        self.buffer.lock().clear();
    }
}

/// Drops answers left over from an earlier request, on the device and in
/// the frame buffer.
fn discard_stale_input(port: &mut dyn SerialPort, buffer: &Mutex<FrameBuffer>) {
    if let Err(err) = port.clear(ClearBuffer::Input) {
        tracing::debug!(error = %err, "failed to clear serial input buffer");
    }
    buffer.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> SerialPortConfig {
        serde_json::from_value(value).expect("config")
    }

    #[test]
    fn settings_default_to_9600_8n1() {
        let settings =
            SerialSettings::from_config(&config(json!({"port": "/dev/ttyUSB0"}))).expect("settings");
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.flow_control, FlowControl::None);
    }

    #[test]
    fn settings_reject_invalid_framing() {
        assert!(SerialSettings::from_config(&config(json!({"port": "COM3", "byteSize": 9}))).is_err());
        assert!(SerialSettings::from_config(&config(json!({"port": "COM3", "parity": "mark"}))).is_err());
        assert!(SerialSettings::from_config(&config(json!({"port": "COM3", "stopBits": 3}))).is_err());
        assert!(SerialSettings::from_config(&config(json!({"port": ""}))).is_err());
        let s = SerialSettings::from_config(&config(
            json!({"port": "COM3", "parity": "E", "byteSize": 7, "rtscts": true}),
        ))
        .expect("settings");
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.flow_control, FlowControl::Hardware);
    }

    #[cfg(unix)]
    #[test]
    fn stale_input_is_discarded_before_a_request() {
        let (mut device, mut port) = serialport::TTYPort::pair().expect("pty pair");
        device.write_all(b"OLD\r\n").expect("write");
        let buffer = Mutex::new(FrameBuffer::default());
        buffer.lock().extend(b"T=1");

        discard_stale_input(&mut port, &buffer);

        assert!(buffer.lock().is_empty());
    }

    #[tokio::test]
    async fn open_missing_device_fails() {
        let settings = SerialSettings::from_config(&config(
            json!({"port": "/dev/sensor-node-test-missing"}),
        ))
        .expect("settings");
        let mut t = SerialTransport::new(settings);
        assert!(matches!(t.open().await, Err(PortError::Open { .. })));
        assert!(!t.is_open());
        assert!(matches!(t.write(b"x").await, Err(PortError::NotOpen)));
    }
}
