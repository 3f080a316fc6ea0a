use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use sensor_node::alert::AlertHub;
use sensor_node::cli::Args;
use sensor_node::config::Config;
use sensor_node::intercom::{mqtt, Intercom};
use sensor_node::registry::{BuildContext, Registry};
use sensor_node::schedule::{Clock, LocalClock, Scheduler};
use sensor_node::sensor::SensorCatalog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ALERT_CAPACITY: usize = 256;

fn init_tracing(args: &Args, alerts: &AlertHub) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_filter().into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(alerts.layer())
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn build_schedulers(config: &Config, catalog: &SensorCatalog, registry: &Registry) -> Vec<Scheduler> {
    let mut schedulers = Vec::new();
    for (name, value) in &config.schedulers {
        let built = Scheduler::from_config(
            name,
            value.clone(),
            catalog,
            &config.node.id,
            &config.project.id,
            config.scheduling.empty_weekday,
            config.scheduling.poll_interval(),
        );
        match built {
            Ok(scheduler) if !registry.is_port(scheduler.port()) => {
                tracing::error!(
                    scheduler = %name,
                    port = %scheduler.port(),
                    "scheduler rejected: port is not a configured port module"
                );
            }
            Ok(scheduler) => schedulers.push(scheduler),
            Err(err) => {
                tracing::error!(scheduler = %name, error = %err, "scheduler rejected");
            }
        }
    }
    schedulers
}

/// Waits up to `limit` for the tasks to finish. Stragglers are left to the
/// runtime shutdown.
async fn join_logged(what: &str, handles: Vec<JoinHandle<()>>, limit: Duration) {
    let count = handles.len();
    match tokio::time::timeout(limit, join_all(handles)).await {
        Ok(results) => {
            for err in results.into_iter().filter_map(|result| result.err()) {
                tracing::error!(task = what, error = %err, "task ended abnormally");
            }
        }
        Err(_) => {
            tracing::warn!(
                task = what,
                tasks = count,
                limit_seconds = limit.as_secs(),
                "tasks did not stop in time"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let alerts = AlertHub::new(ALERT_CAPACITY);
    init_tracing(&args, &alerts)?;

    let config = Config::load(&args.config)?;
    tracing::info!(
        node = %config.node.id,
        project = %config.project.id,
        config = %args.config.display(),
        "configuration loaded"
    );

    let bus = Intercom::new();
    let registry = Registry::from_config(
        &config.modules,
        &BuildContext {
            bus: bus.clone(),
            alerts: Some(alerts.clone()),
        },
    );
    let bridge_enabled = config.mqtt.enabled;
    let mut catalog = SensorCatalog::from_config(&config.sensors);
    catalog.retain_routable(|receiver| bridge_enabled || registry.contains(receiver));
    let schedulers = build_schedulers(&config, &catalog, &registry);

    if args.check {
        println!("node {} (project {})", config.node.id, config.project.id);
        println!("modules: {}", registry.names().join(", "));
        println!("sensors: {}", catalog.len());
        let names: Vec<&str> = schedulers.iter().map(Scheduler::name).collect();
        println!("schedulers: {}", names.join(", "));
        println!(
            "mqtt bridge: {}",
            if bridge_enabled { config.mqtt.url.as_str() } else { "disabled" }
        );
        return Ok(());
    }

    let schedulers_cancel = CancellationToken::new();
    let ports_cancel = CancellationToken::new();
    let workers_cancel = CancellationToken::new();
    let bridge_cancel = CancellationToken::new();

    let bridge_handle = if bridge_enabled {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        bus.set_remote(outbound_tx);
        let mqtt_config = config.mqtt.clone();
        let node_id = config.node.id.clone();
        let bridge_bus = bus.clone();
        let cancel = bridge_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(err) =
                mqtt::run_mqtt_bridge(mqtt_config, node_id, bridge_bus, outbound_rx, cancel).await
            {
                tracing::error!(error = %err, "mqtt bridge exited");
            }
        }))
    } else {
        None
    };

    let running = registry.start(&bus, &workers_cancel, &ports_cancel);
    let clock: Arc<dyn Clock> = Arc::new(LocalClock);
    let scheduler_handles: Vec<_> = schedulers
        .into_iter()
        .map(|scheduler| {
            scheduler.start(bus.clone(), clock.clone(), schedulers_cancel.child_token())
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let grace = config.shutdown_grace();
    schedulers_cancel.cancel();
    ports_cancel.cancel();
    join_logged("scheduler", scheduler_handles, grace).await;
    join_logged("port", running.ports, grace).await;

    if !bus.drain(grace).await {
        tracing::warn!(
            in_flight = bus.in_flight(),
            grace_seconds = grace.as_secs(),
            "grace period elapsed with observations in flight"
        );
    }

    workers_cancel.cancel();
    join_logged("module", running.workers, grace).await;
    bridge_cancel.cancel();
    if let Some(handle) = bridge_handle {
        join_logged("mqtt bridge", vec![handle], grace).await;
    }
    tracing::info!("sensor node stopped");
    Ok(())
}
