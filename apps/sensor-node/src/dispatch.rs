use crate::intercom::{Delivery, Envelope, Intercom, Subscription};
use crate::message::{Message, Notification, ServiceAction};
use crate::observation::{Hop, Observation};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// What a handler wants done with an observation after processing it.
#[derive(Debug)]
pub enum Disposition {
    /// Pass to the next receiver in the chain.
    Forward(Observation),
    /// Send back to the port at the head of the chain.
    Restart(Observation),
    /// End the chain here.
    Stop,
}

/// A named module that observations are routed through.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Topics received in addition to the module name.
    fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    async fn handle_observation(&self, obs: Observation) -> Result<Disposition>;

    async fn handle_notification(&self, notification: Notification) -> Result<()> {
        tracing::debug!(
            module = self.name(),
            kind = notification.kind.tag(),
            "ignoring notification"
        );
        Ok(())
    }

    /// Background work that runs for the lifetime of the module.
    async fn run(&self, _bus: Intercom, _cancel: CancellationToken) {}
}

/// Publishes the next hop of a chain, or logs that the chain is complete.
pub fn forward(bus: &Intercom, from: &str, hop: Hop) -> Option<Delivery> {
    match hop {
        Hop::Forward {
            target,
            observation,
        } => {
            tracing::debug!(
                module = from,
                target = %target,
                id = %observation.id,
                next_receiver = observation.next_receiver,
                "forwarding observation"
            );
            Some(bus.publish(&target, Message::observation(observation)))
        }
        Hop::Finished(observation) => {
            tracing::debug!(
                module = from,
                observation = %observation.name,
                id = %observation.id,
                "receiver chain finished"
            );
            None
        }
    }
}

/// Runs one handler against its subscription. Each message gets its own
/// task so a slow observation does not hold up the next one.
pub struct Worker {
    handler: Arc<dyn Handler>,
    bus: Intercom,
    running: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl Worker {
    pub fn new(handler: Arc<dyn Handler>, bus: Intercom) -> Self {
        Self {
            handler,
            bus,
            running: Arc::new(AtomicBool::new(true)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus
            .subscribe(self.handler.name(), &self.handler.topics())
    }

    pub fn start(self, mut subscription: Subscription, cancel: CancellationToken) -> JoinHandle<()> {
        let background = {
            let handler = self.handler.clone();
            let bus = self.bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.run(bus, cancel).await })
        };

        tokio::spawn(async move {
            tracing::info!(module = self.handler.name(), "module started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = subscription.recv() => {
                        let Some(envelope) = maybe else { break; };
                        self.dispatch(envelope);
                    }
                }
            }
            self.tracker.close();
            self.tracker.wait().await;
            background.abort();
            tracing::info!(module = self.handler.name(), "module stopped");
        })
    }

    fn dispatch(&self, envelope: Envelope) {
        if let Message::Notification(notification) = &envelope.message {
            if let Some(action) = notification.service_action() {
                self.apply_service(action);
                return;
            }
        }

        let handler = self.handler.clone();
        let bus = self.bus.clone();
        let running = self.running.load(Ordering::SeqCst);
        self.tracker.spawn(async move {
            let (message, guard) = envelope.into_parts();
            match message {
                Message::Observation(obs) => {
                    process_observation(handler.as_ref(), &bus, running, *obs).await;
                }
                Message::Notification(notification) => {
                    if let Err(err) = handler.handle_notification(notification).await {
                        tracing::warn!(module = handler.name(), error = %err, "notification handling failed");
                    }
                }
            }
            drop(guard);
        });
    }

    fn apply_service(&self, action: ServiceAction) {
        let run = action == ServiceAction::Start;
        let was = self.running.swap(run, Ordering::SeqCst);
        if was != run {
            tracing::info!(module = self.handler.name(), running = run, "module service state changed");
        }
    }
}

/// Applies the handler to one observation and forwards the result.
pub async fn process_observation(
    handler: &dyn Handler,
    bus: &Intercom,
    running: bool,
    obs: Observation,
) -> Option<Delivery> {
    let name = handler.name();
    if !obs.enabled || !running {
        return forward(bus, name, obs.advance());
    }

    let observation = obs.name.clone();
    let id = obs.id.clone();
    match handler.handle_observation(obs).await {
        Ok(Disposition::Forward(obs)) => forward(bus, name, obs.advance()),
        Ok(Disposition::Restart(obs)) => forward(bus, name, obs.restart()),
        Ok(Disposition::Stop) => {
            tracing::debug!(module = name, observation = %observation, id = %id, "chain stopped by module");
            None
        }
        Err(err) => {
            tracing::error!(
                module = name,
                observation = %observation,
                id = %id,
                error = %err,
                "module failed to process observation"
            );
            None
        }
    }
}
