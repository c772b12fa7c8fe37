use anyhow::Context;
use async_nats::{Client, ConnectOptions, Subscriber};
use tracing::{info, warn};

use crate::config::BusConfig;

pub async fn connect(config: &BusConfig) -> anyhow::Result<Client> {
    let client = ConnectOptions::new()
        .name(config.client_name.as_str())
        .max_reconnects(None::<usize>)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("bus connection established"),
                async_nats::Event::Disconnected => warn!("bus connection lost; reconnecting"),
                other => info!(event = %other, "bus event"),
            }
        })
        .connect(config.url.as_str())
        .await
        .with_context(|| format!("failed to connect to NATS at {}", config.url))?;
    info!(url = %config.url, "connected to NATS");
    Ok(client)
}

/// Queue subscription so every worker in the group shares the install subject.
pub async fn subscribe(client: &Client, config: &BusConfig) -> anyhow::Result<Subscriber> {
    client
        .queue_subscribe(config.install_subject.clone(), config.queue_group.clone())
        .await
        .with_context(|| {
            format!(
                "failed to subscribe to {} in queue group {}",
                config.install_subject, config.queue_group
            )
        })
}
