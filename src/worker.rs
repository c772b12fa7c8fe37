//! Listener lifecycle: subscribe, fan out one task per message, drain on shutdown.

use std::sync::Arc;

use anyhow::Context;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus;
use crate::config::WorkerConfig;
use crate::pipeline::ServiceContext;
use crate::signals::{ShutdownSignals, spawn_shutdown_watcher};
use crate::status::NatsStatusPublisher;

pub async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let client = bus::connect(&config.bus).await?;
    let shutdown = CancellationToken::new();
    let publisher = Arc::new(NatsStatusPublisher::new(
        client.clone(),
        config.bus.status_subject.clone(),
    ));
    let ctx = Arc::new(ServiceContext::new(&config, publisher, shutdown.clone()));
    for (db_type, path) in ctx.playbooks().missing_playbooks() {
        warn!(%db_type, path = %path.display(), "playbook missing; requests for it will fail");
    }

    let signals =
        ShutdownSignals::register().context("failed to register shutdown signal handlers")?;
    let mut subscriber = bus::subscribe(&client, &config.bus).await?;
    info!(
        subject = %config.bus.install_subject,
        status_subject = %config.bus.status_subject,
        queue_group = %config.bus.queue_group,
        "listening for install requests"
    );
    spawn_shutdown_watcher(signals, shutdown.clone());

    let in_flight = accept(Arc::clone(&ctx), (&mut subscriber).map(|message| message.payload)).await;

    // Leave the queue group before waiting so new requests go to other workers.
    if let Err(err) = subscriber.unsubscribe().await {
        warn!(error = %err, "failed to unsubscribe");
    }
    let handled = in_flight.wait().await;

    client
        .flush()
        .await
        .context("failed to flush NATS connection")?;
    info!(handled, "worker stopped");
    Ok(())
}

/// Runs [`accept`] and then waits for everything it started. Returns the
/// number of payloads handled.
pub async fn serve<S, P>(ctx: Arc<ServiceContext>, payloads: S) -> usize
where
    S: Stream<Item = P> + Unpin,
    P: AsRef<[u8]> + Send + 'static,
{
    accept(ctx, payloads).await.wait().await
}

/// Spawns one pipeline task per payload until the stream ends or shutdown is
/// requested. The stream is dropped on return; runs still going are handed
/// back in the returned [`InFlight`].
pub async fn accept<S, P>(ctx: Arc<ServiceContext>, mut payloads: S) -> InFlight
where
    S: Stream<Item = P> + Unpin,
    P: AsRef<[u8]> + Send + 'static,
{
    let shutdown = ctx.shutdown().clone();
    let mut in_flight = InFlight {
        ctx: Arc::clone(&ctx),
        tasks: JoinSet::new(),
        handled: 0,
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(joined) = in_flight.tasks.join_next(), if !in_flight.tasks.is_empty() => {
                in_flight.handled += record_completion(joined);
            }
            next = payloads.next() => match next {
                Some(payload) => {
                    let ctx = Arc::clone(&ctx);
                    in_flight.tasks.spawn(async move {
                        ctx.handle_message(payload.as_ref()).await;
                    });
                }
                None => break,
            },
        }
    }
    in_flight
}

/// Pipeline runs started by [`accept`] that may still be going.
pub struct InFlight {
    ctx: Arc<ServiceContext>,
    tasks: JoinSet<()>,
    handled: usize,
}

impl InFlight {
    /// Runs not yet reaped, finished or not.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every run, flushes the publisher and returns the number of
    /// payloads handled.
    pub async fn wait(mut self) -> usize {
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "waiting for in-flight installs");
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.handled += record_completion(joined);
        }
        if let Err(err) = self.ctx.publisher().flush().await {
            warn!(error = %err, "failed to flush status publisher");
        }
        self.handled
    }
}

fn record_completion(joined: Result<(), tokio::task::JoinError>) -> usize {
    match joined {
        Ok(()) => 1,
        Err(err) => {
            error!(error = %err, "install task panicked");
            0
        }
    }
}
