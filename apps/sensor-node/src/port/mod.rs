pub mod serial;
pub mod tcp;
pub mod virtual_sensor;

use crate::dispatch::forward;
use crate::error::PortError;
use crate::intercom::{Envelope, Intercom, Subscription};
use crate::message::Message;
use crate::observation::{Observation, RequestSet};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PASSIVE_READ_WINDOW: Duration = Duration::from_secs(1);
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Byte stream to a sensor.
///
/// `read_until` must be cancel-safe: bytes received before the future is
/// dropped stay buffered for the next call.
#[async_trait]
pub trait Transport: Send {
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<(), PortError>;

    /// Sends `data`. Unread input left over from earlier requests is
    /// discarded first.
    async fn write(&mut self, data: &[u8]) -> Result<(), PortError>;

    /// Reads one frame terminated by `delimiter`, without the delimiter.
    /// Returns `Ok(None)` when `timeout` elapses first.
    async fn read_until(
        &mut self,
        delimiter: &[u8],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, PortError>;

    async fn close(&mut self);
}

/// Receive buffer shared by the transports.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Removes and returns the first complete frame. With an empty delimiter
    /// everything buffered counts as one frame.
    pub fn take_frame(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        if delimiter.is_empty() {
            if self.buf.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.buf));
        }
        let pos = self
            .buf
            .windows(delimiter.len())
            .position(|window| window == delimiter)?;
        let mut frame: Vec<u8> = self.buf.drain(..pos + delimiter.len()).collect();
        frame.truncate(pos);
        Some(frame)
    }
}

/// Drives the request/response cycle of one port module.
pub struct PortDriver {
    name: String,
    transport: Box<dyn Transport>,
    max_attempts: u32,
    passive: Option<Observation>,
    running: bool,
}

impl PortDriver {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, max_attempts: u32) -> Self {
        Self {
            name: name.into(),
            transport,
            max_attempts: max_attempts.max(1),
            passive: None,
            running: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_passive(&self) -> bool {
        self.passive.is_some()
    }

    pub fn start(
        self,
        bus: Intercom,
        subscription: Subscription,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(bus, subscription, cancel))
    }

    async fn run(mut self, bus: Intercom, mut subscription: Subscription, cancel: CancellationToken) {
        tracing::info!(port = %self.name, transport = %self.transport.describe(), "port started");
        loop {
            let Some(template) = self.passive.clone() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = subscription.recv() => {
                        let Some(envelope) = maybe else { break; };
                        if !self.on_envelope_or_cancel(&bus, envelope, &cancel).await {
                            break;
                        }
                    }
                }
                continue;
            };

            if !self.transport.is_open() {
                if let Err(err) = self.transport.open().await {
                    tracing::error!(port = %self.name, error = %err, "failed to open port in passive mode");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(REOPEN_BACKOFF) => continue,
                    }
                }
            }

            let delimiter = passive_delimiter(&template);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe = subscription.recv() => {
                    let Some(envelope) = maybe else { break; };
                    if !self.on_envelope_or_cancel(&bus, envelope, &cancel).await {
                        break;
                    }
                }
                frame = self.transport.read_until(&delimiter, PASSIVE_READ_WINDOW) => {
                    match frame {
                        Ok(Some(frame)) => {
                            let obs = self.synthesize(&template, &frame);
                            tracing::debug!(port = %self.name, id = %obs.id, "passive frame received");
                            forward(&bus, &self.name, obs.advance());
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(port = %self.name, error = %err, "passive read failed; reopening");
                            self.transport.close().await;
                        }
                    }
                }
            }
        }
        self.transport.close().await;
        tracing::info!(port = %self.name, "port stopped");
    }

    /// Handles one envelope unless shutdown interrupts it. An interrupted
    /// request cycle abandons its observation. Returns false on shutdown.
    async fn on_envelope_or_cancel(
        &mut self,
        bus: &Intercom,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> bool {
        let name = self.name.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(port = %name, "request cycle interrupted by shutdown");
                false
            }
            _ = self.on_envelope(bus, envelope) => true,
        }
    }

    async fn on_envelope(&mut self, bus: &Intercom, envelope: Envelope) {
        let (message, _guard) = envelope.into_parts();
        let obs = match message {
            Message::Observation(obs) => *obs,
            Message::Notification(notification) => {
                if let Some(action) = notification.service_action() {
                    self.running = action == crate::message::ServiceAction::Start;
                    tracing::info!(port = %self.name, running = self.running, "port service state changed");
                }
                return;
            }
        };

        if !obs.enabled || !self.running {
            forward(bus, &self.name, obs.advance());
            return;
        }

        if obs.passive_mode {
            tracing::info!(port = %self.name, observation = %obs.name, "entering passive mode");
            self.passive = Some(obs);
            return;
        }
        if self.passive.take().is_some() {
            tracing::info!(port = %self.name, observation = %obs.name, "leaving passive mode");
        }

        let name = obs.name.clone();
        let id = obs.id.clone();
        match self.execute(obs).await {
            Ok(obs) => {
                forward(bus, &self.name, obs.advance());
            }
            Err(err) => {
                tracing::error!(
                    port = %self.name,
                    observation = %name,
                    id = %id,
                    error = %err,
                    "sensor communication failed; observation abandoned"
                );
            }
        }
    }

    /// Runs every enabled request set in `requestsOrder` against the sensor.
    /// A request that times out leaves its response unset.
    pub async fn execute(&mut self, mut obs: Observation) -> Result<Observation, PortError> {
        let mut captured_at = None;
        for name in obs.requests_order.clone() {
            let Some(set) = obs.request_sets.get(&name).cloned() else {
                continue;
            };
            if !set.enabled {
                tracing::debug!(port = %self.name, request = %name, "request set disabled");
                continue;
            }

            match self.request(&set).await? {
                Some(response) => {
                    captured_at = Some(Utc::now());
                    if let Some(target) = obs.request_sets.get_mut(&name) {
                        target.response = Some(response);
                    }
                }
                None => {
                    tracing::warn!(
                        port = %self.name,
                        observation = %obs.name,
                        request = %name,
                        timeout = set.timeout,
                        "no response from sensor within timeout"
                    );
                }
            }
            tokio::time::sleep(set.sleep()).await;
        }
        obs.timestamp = Some(captured_at.unwrap_or_else(Utc::now));
        Ok(obs)
    }

    async fn request(&mut self, set: &RequestSet) -> Result<Option<String>, PortError> {
        let mut last = PortError::NotOpen;
        for attempt in 1..=self.max_attempts {
            match self.request_once(set).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::warn!(
                        port = %self.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "port access failed"
                    );
                    self.transport.close().await;
                    last = err;
                }
            }
        }
        Err(PortError::Exhausted {
            attempts: self.max_attempts,
            last: Box::new(last),
        })
    }

    async fn request_once(&mut self, set: &RequestSet) -> Result<Option<String>, PortError> {
        if !self.transport.is_open() {
            self.transport.open().await?;
        }
        if !set.request.is_empty() {
            self.transport.write(set.request.as_bytes()).await?;
        }
        let frame = self
            .transport
            .read_until(set.response_delimiter.as_bytes(), set.timeout())
            .await?;
        Ok(frame.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn synthesize(&self, template: &Observation, frame: &[u8]) -> Observation {
        let mut obs = template.renew();
        obs.port_name = self.name.clone();
        if let Some(set) = first_enabled_set(&mut obs) {
            set.response = Some(String::from_utf8_lossy(frame).into_owned());
        }
        obs.timestamp = Some(Utc::now());
        obs
    }
}

fn first_enabled_set(obs: &mut Observation) -> Option<&mut RequestSet> {
    let name = obs
        .requests_order
        .iter()
        .find(|name| obs.request_sets.get(*name).is_some_and(|set| set.enabled))?
        .clone();
    obs.request_sets.get_mut(&name)
}

fn passive_delimiter(template: &Observation) -> Vec<u8> {
    template
        .requests_order
        .iter()
        .filter_map(|name| template.request_sets.get(name))
        .find(|set| set.enabled)
        .map(|set| set.response_delimiter.as_bytes().to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::virtual_sensor::{VirtualPortConfig, VirtualTransport};
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn weather_obs() -> Observation {
        let mut obs: Observation = serde_json::from_value(json!({
            "name": "getValues",
            "type": "observation",
            "id": Observation::new_id(),
            "portName": "com1",
            "receivers": ["com1", "preProcessor", "fileExporter"],
            "requestsOrder": ["getTemperature", "getPressure"],
            "requestSets": {
                "getTemperature": {
                    "request": "TEMP?\\r",
                    "responseDelimiter": "\\r",
                    "responsePattern": "(?P<temperature>[+-]?\\d+\\.+\\d)",
                    "sleepTime": 0.5,
                    "timeout": 1.0
                },
                "getPressure": {
                    "request": "PRES?\\r",
                    "responseDelimiter": "\\r",
                    "responsePattern": "(?P<pressure>[+-]?\\d+\\.+\\d)",
                    "sleepTime": 0.5,
                    "timeout": 1.0
                }
            },
            "responseSets": {
                "temperature": {"type": "float", "unit": "C"},
                "pressure": {"type": "float", "unit": "mbar"}
            }
        }))
        .expect("obs");
        obs.decode_escapes();
        obs
    }

    fn virtual_port(responses: serde_json::Value) -> (VirtualTransport, virtual_sensor::VirtualHandle) {
        let config: VirtualPortConfig =
            serde_json::from_value(json!({ "responses": responses })).expect("config");
        VirtualTransport::new("com1", &config).expect("transport")
    }

    async fn recv_obs(sub: &mut Subscription) -> Observation {
        let env = tokio::time::timeout(Duration::from_secs(30), sub.recv())
            .await
            .expect("timely")
            .expect("envelope");
        match env.message {
            Message::Observation(obs) => *obs,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frame_buffer_splits_on_delimiter() {
        let mut buf = FrameBuffer::default();
        buf.extend(b">+23.1\r>+10");
        assert_eq!(buf.take_frame(b"\r"), Some(b">+23.1".to_vec()));
        assert_eq!(buf.take_frame(b"\r"), None);
        buf.extend(b"11.3\r\n");
        assert_eq!(buf.take_frame(b"\r\n"), Some(b">+1011.3".to_vec()));
        assert!(buf.is_empty());
        buf.extend(b"raw");
        assert_eq!(buf.take_frame(b""), Some(b"raw".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn active_cycle_captures_each_response_in_order() {
        let (transport, handle) = virtual_port(json!([
            {"pattern": "^TEMP", "response": ">+23.1\\r"},
            {"pattern": "^PRES", "response": ">+1011.3\\r"}
        ]));
        let mut driver = PortDriver::new("com1", Box::new(transport), 3);
        let obs = driver.execute(weather_obs()).await.expect("execute");

        assert_eq!(
            obs.request_sets["getTemperature"].response.as_deref(),
            Some(">+23.1")
        );
        assert_eq!(
            obs.request_sets["getPressure"].response.as_deref(),
            Some(">+1011.3")
        );
        assert!(obs.timestamp.is_some());
        assert_eq!(handle.written(), vec![b"TEMP?\r".to_vec(), b"PRES?\r".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_response_unset_and_continues() {
        let (transport, _handle) = virtual_port(json!([
            {"pattern": "^PRES", "response": ">+1011.3\\r"}
        ]));
        let mut driver = PortDriver::new("com1", Box::new(transport), 3);
        let started = tokio::time::Instant::now();
        let obs = driver.execute(weather_obs()).await.expect("execute");

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(obs.request_sets["getTemperature"].response.is_none());
        assert_eq!(
            obs.request_sets["getPressure"].response.as_deref(),
            Some(">+1011.3")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_request_sets_are_skipped() {
        let (transport, handle) = virtual_port(json!([
            {"pattern": "^PRES", "response": ">+1011.3\\r"}
        ]));
        let mut driver = PortDriver::new("com1", Box::new(transport), 3);
        let mut obs = weather_obs();
        obs.request_sets
            .get_mut("getTemperature")
            .expect("set")
            .enabled = false;
        driver.execute(obs).await.expect("execute");
        assert_eq!(handle.written(), vec![b"PRES?\r".to_vec()]);
    }

    struct BrokenTransport {
        opens: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Transport for BrokenTransport {
        fn describe(&self) -> String {
            "broken".to_string()
        }

        fn is_open(&self) -> bool {
            false
        }

        async fn open(&mut self) -> Result<(), PortError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(PortError::Open {
                target: "broken".to_string(),
                reason: "no such device".to_string(),
            })
        }

        async fn write(&mut self, _data: &[u8]) -> Result<(), PortError> {
            Err(PortError::NotOpen)
        }

        async fn read_until(
            &mut self,
            _delimiter: &[u8],
            _timeout: Duration,
        ) -> Result<Option<Vec<u8>>, PortError> {
            Err(PortError::NotOpen)
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn transport_failures_are_bounded_by_max_attempts() {
        let opens = Arc::new(AtomicU32::new(0));
        let mut driver = PortDriver::new(
            "com1",
            Box::new(BrokenTransport {
                opens: opens.clone(),
            }),
            3,
        );
        let err = driver.execute(weather_obs()).await.expect_err("should fail");
        assert!(matches!(err, PortError::Exhausted { attempts: 3, .. }));
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_forwards_to_next_receiver() {
        let (transport, _handle) = virtual_port(json!([
            {"pattern": "^TEMP", "response": ">+23.1\\r"},
            {"pattern": "^PRES", "response": ">+1011.3\\r"}
        ]));
        let bus = Intercom::new();
        let port_sub = bus.subscribe("com1", &[]);
        let mut next = bus.subscribe("preProcessor", &[]);
        let cancel = CancellationToken::new();
        let handle = PortDriver::new("com1", Box::new(transport), 3).start(
            bus.clone(),
            port_sub,
            cancel.clone(),
        );

        let obs = weather_obs();
        let id = obs.id.clone();
        bus.publish("com1", Message::observation(obs));
        let out = recv_obs(&mut next).await;
        assert_eq!(out.next_receiver, 1);
        assert_eq!(out.id, id);
        assert!(out.request_sets["getPressure"].response.is_some());

        cancel.cancel();
        handle.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_pending_request() {
        let (transport, _handle) = virtual_port(json!([]));
        let bus = Intercom::new();
        let port_sub = bus.subscribe("com1", &[]);
        let cancel = CancellationToken::new();
        let handle = PortDriver::new("com1", Box::new(transport), 3).start(
            bus.clone(),
            port_sub,
            cancel.clone(),
        );

        let mut obs = weather_obs();
        for set in obs.request_sets.values_mut() {
            set.timeout = 600.0;
        }
        bus.publish("com1", Message::observation(obs));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancelled_at = tokio::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("port stops promptly")
            .expect("join");
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert!(bus.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn passive_mode_synthesizes_observations_from_frames() {
        let (transport, handle) = virtual_port(json!([
            {"pattern": "^TEMP", "response": ">+23.1\\r"},
            {"pattern": "^PRES", "response": ">+1011.3\\r"}
        ]));
        let bus = Intercom::new();
        let port_sub = bus.subscribe("com1", &[]);
        let mut next = bus.subscribe("preProcessor", &[]);
        let cancel = CancellationToken::new();
        let driver_handle = PortDriver::new("com1", Box::new(transport), 3).start(
            bus.clone(),
            port_sub,
            cancel.clone(),
        );

        let mut passive = weather_obs();
        passive.passive_mode = true;
        let template_id = passive.id.clone();
        bus.publish("com1", Message::observation(passive));

        // Let the driver switch modes before data arrives.
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.push(b">+19.9\r");
        let first = recv_obs(&mut next).await;
        assert_eq!(
            first.request_sets["getTemperature"].response.as_deref(),
            Some(">+19.9")
        );
        assert_ne!(first.id, template_id);
        assert_eq!(first.next_receiver, 1);

        handle.push(b">+20.4\r");
        let second = recv_obs(&mut next).await;
        assert_ne!(second.id, first.id);
        assert!(handle.written().is_empty());

        let active = weather_obs();
        bus.publish("com1", Message::observation(active));
        let third = recv_obs(&mut next).await;
        assert_eq!(
            third.request_sets["getPressure"].response.as_deref(),
            Some(">+1011.3")
        );
        assert_eq!(handle.written().len(), 2);

        cancel.cancel();
        driver_handle.await.expect("join");
    }
}
