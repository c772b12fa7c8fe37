use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process signals that stop the worker: SIGINT (Ctrl-C), SIGTERM or SIGQUIT.
#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Installs the handlers. Must run inside a tokio runtime.
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {},
            _ = self.sigterm.recv() => {},
            _ = self.sigquit.recv() => {},
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

/// Cancels `shutdown` once a signal arrives, never before.
pub fn spawn_shutdown_watcher(mut signals: ShutdownSignals, shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = signals.recv() => {
                info!("shutdown requested; stopping worker");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    });
}
