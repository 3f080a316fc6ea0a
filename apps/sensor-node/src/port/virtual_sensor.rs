use super::{FrameBuffer, Transport};
use crate::error::{ConfigError, PortError};
use crate::observation::{secs, unescape};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPortConfig {
    /// Replies keyed by a pattern matched against each request.
    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
    /// Frames the sensor sends on its own, cycled every `frameInterval`
    /// seconds.
    #[serde(default)]
    pub frames: Vec<String>,
    #[serde(default)]
    pub frame_interval: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedResponse {
    pub pattern: String,
    pub response: String,
}

fn default_max_attempts() -> u32 {
    3
}

/// In-memory sensor used for simulation and tests.
pub struct VirtualTransport {
    name: String,
    script: Vec<(Regex, Vec<u8>)>,
    frames: Vec<Vec<u8>>,
    frame_interval: Option<Duration>,
    next_frame: usize,
    next_frame_at: Option<Instant>,
    buffer: FrameBuffer,
    inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    open: bool,
}

/// Test-side handle: injects unsolicited bytes and records what the port
/// wrote.
#[derive(Clone)]
pub struct VirtualHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl VirtualHandle {
    pub fn push(&self, data: &[u8]) {
        let _ = self.tx.send(data.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

impl VirtualTransport {
    pub fn new(
        name: &str,
        config: &VirtualPortConfig,
    ) -> Result<(Self, VirtualHandle), ConfigError> {
        let script = config
            .responses
            .iter()
            .map(|entry| {
                Regex::new(&entry.pattern)
                    .map(|re| (re, unescape(&entry.response).into_bytes()))
                    .map_err(|source| ConfigError::InvalidPattern {
                        name: entry.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let frame_interval = secs(config.frame_interval);
        let frames: Vec<Vec<u8>> = config
            .frames
            .iter()
            .map(|frame| unescape(frame).into_bytes())
            .collect();
        if !frames.is_empty() && frame_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "frameInterval",
                reason: "frames need a positive interval".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            name: name.to_string(),
            script,
            frames,
            frame_interval: (!frame_interval.is_zero()).then_some(frame_interval),
            next_frame: 0,
            next_frame_at: None,
            buffer: FrameBuffer::default(),
            inbound: Some(rx),
            written: written.clone(),
            open: false,
        };
        Ok((transport, VirtualHandle { tx, written }))
    }

    fn emit_due_frame(&mut self, now: Instant) {
        let (Some(interval), Some(due)) = (self.frame_interval, self.next_frame_at) else {
            return;
        };
        if self.frames.is_empty() || now < due {
            return;
        }
        let frame = &self.frames[self.next_frame % self.frames.len()];
        self.buffer.extend(frame);
        self.next_frame += 1;
        self.next_frame_at = Some(due + interval);
    }
}

async fn recv_inbound(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Transport for VirtualTransport {
    fn describe(&self) -> String {
        format!("virtual:{}", self.name)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), PortError> {
        self.open = true;
        if let Some(interval) = self.frame_interval {
            self.next_frame_at = Some(Instant::now() + interval);
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        if !self.open {
            return Err(PortError::NotOpen);
        }
        self.buffer.clear();
        self.written.lock().push(data.to_vec());
        let request = String::from_utf8_lossy(data);
        if let Some((_, response)) = self.script.iter().find(|(re, _)| re.is_match(&request)) {
            self.buffer.extend(response);
        }
        Ok(())
    }

    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, PortError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.open {
                return Err(PortError::NotOpen);
            }
            self.emit_due_frame(Instant::now());
            if let Some(frame) = self.buffer.take_frame(delimiter) {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = match self.next_frame_at {
                Some(due) if due < deadline => due,
                _ => deadline,
            };
            tokio::select! {
                maybe = recv_inbound(&mut self.inbound) => match maybe {
                    Some(data) => self.buffer.extend(&data),
                    None => self.inbound = None,
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        self.next_frame_at = None;
        self.buffer.clear();
    }
}
