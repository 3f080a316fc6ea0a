use super::{Delivery, Intercom, Outbound};
use crate::config::MqttConfig;
use crate::message::Message;
use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Topic layout for one node: messages for local modules arrive below
/// `<prefix>/<node>/in/`, unrouted local messages leave below
/// `<prefix>/<node>/out/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTopics {
    base: String,
}

impl BridgeTopics {
    pub fn new(prefix: &str, node_id: &str) -> Self {
        Self {
            base: format!("{}/{}", prefix.trim_end_matches('/'), node_id),
        }
    }

    pub fn inbound_filter(&self) -> String {
        format!("{}/in/#", self.base)
    }

    pub fn outbound(&self, topic: &str) -> String {
        format!("{}/out/{}", self.base, topic)
    }

    /// Local topic for a broker topic, if it belongs to this node's inbox.
    pub fn local_topic<'a>(&self, broker_topic: &'a str) -> Option<&'a str> {
        broker_topic
            .strip_prefix(self.base.as_str())?
            .strip_prefix("/in/")
            .filter(|topic| !topic.is_empty())
    }
}

pub async fn run_mqtt_bridge(
    config: MqttConfig,
    node_id: String,
    bus: Intercom,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) -> Result<()> {
    let (host, port) = config.endpoint()?;
    let topics = BridgeTopics::new(&config.topic_prefix, &node_id);
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("sensor-node-{node_id}"));

    loop {
        let mut opts = MqttOptions::new(client_id.clone(), host.clone(), port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.max(5)));
        if let Some(username) = &config.username {
            opts.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(opts, 256);
        if let Err(err) = client
            .subscribe(topics.inbound_filter(), QoS::AtLeastOnce)
            .await
        {
            tracing::warn!(error=%err, "failed to subscribe to inbound topic; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep(Duration::from_secs(2)) => continue,
            }
        }

        tracing::info!(host=%host, port, topic=%topics.inbound_filter(), "MQTT bridge started");
        let mut poller = spawn_poller(eventloop, bus.clone(), topics.clone());
        let mut last_err: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    poller.abort();
                    let _ = client.try_disconnect();
                    return Ok(());
                }

                res = &mut poller => {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => last_err = Some(err),
                        Err(err) => last_err = Some(err.into()),
                    }
                    break;
                }

                maybe = outbound.recv() => {
                    let Some(out) = maybe else {
                        poller.abort();
                        return Ok(());
                    };
                    publish_outbound(&client, &topics, out);
                }
            }
        }

        poller.abort();
        tracing::warn!(error=?last_err, "MQTT bridge connection loop restarting");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }
}

fn spawn_poller(
    mut eventloop: rumqttc::EventLoop,
    bus: Intercom,
    topics: BridgeTopics,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some(topic) = topics.local_topic(&publish.topic) else {
                        continue;
                    };
                    match Message::from_slice(&publish.payload) {
                        Ok(message) => {
                            if let Delivery::Delivered(count) = bus.publish_local(topic, message) {
                                tracing::debug!(topic, count, "bridged inbound message");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(topic, error=%err, "discarding malformed inbound message");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => return Err(anyhow!(err)),
            }
        }
    })
}

fn publish_outbound(client: &AsyncClient, topics: &BridgeTopics, out: Outbound) {
    let published = out
        .message
        .to_json()
        .map_err(anyhow::Error::from)
        .and_then(|payload| {
            client
                .try_publish(topics.outbound(&out.topic), QoS::AtLeastOnce, false, payload)
                .map_err(anyhow::Error::from)
        });
    if let Err(err) = published {
        log_publish_failure(&out, &err);
    }
}

/// Lost observations are worth a warning. Lost notifications are not: an
/// alert about an undeliverable alert would be queued behind the same
/// failure.
fn log_publish_failure(out: &Outbound, err: &anyhow::Error) {
    match &out.message {
        Message::Observation(obs) => tracing::warn!(
            topic = %out.topic,
            observation = %obs.name,
            id = %obs.id,
            error = %err,
            "failed to publish to MQTT bridge"
        ),
        Message::Notification(n) => tracing::debug!(
            topic = %out.topic,
            kind = n.kind.tag(),
            error = %err,
            "failed to publish notification to MQTT bridge"
        ),
    }
}
