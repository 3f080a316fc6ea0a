use super::{FrameBuffer, Transport};
use crate::error::{ConfigError, PortError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpPortConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_max_attempts() -> u32 {
    3
}

impl TcpPortConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "port must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Sensor reachable through a serial-to-ethernet converter or a native
/// network interface.
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    buffer: FrameBuffer,
}

impl TcpTransport {
    pub fn new(config: &TcpPortConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: crate::observation::secs(config.connect_timeout),
            stream: None,
            buffer: FrameBuffer::default(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn describe(&self) -> String {
        format!("tcp:{}:{}", self.host, self.port)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self) -> Result<(), PortError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(PortError::Open {
                    target: self.describe(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(PortError::Open {
                    target: self.describe(),
                    reason: "connect timed out".to_string(),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        self.buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        let stream = self.stream.as_mut().ok_or(PortError::NotOpen)?;
        self.buffer.clear();
        stream.write_all(data).await.map_err(PortError::Write)?;
        stream.flush().await.map_err(PortError::Write)
    }

    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, PortError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(frame) = self.buffer.take_frame(delimiter) {
                return Ok(Some(frame));
            }
            let stream = self.stream.as_mut().ok_or(PortError::NotOpen)?;
            match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(PortError::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(Ok(n)) => self.buffer.extend(&chunk[..n]),
                Ok(Err(err)) => return Err(PortError::Read(err)),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.buffer.clear();
    }
}
