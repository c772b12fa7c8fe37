//! One pipeline run per inbound message.
//!
//! `Received → Validated → InventoryWritten → PlaybookSelected → Executing →
//! StatusPublished → ArtifactRemoved`. Failures before `Executing` jump
//! straight to `StatusPublished`; the inventory guard outlives the publish and
//! removes the file on every path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::ProvisionError;
use crate::inventory::{InventoryFile, InventoryWriter};
use crate::playbook::PlaybookSelector;
use crate::request::{ValidatedRequest, decode_request};
use crate::runner::PlaybookRunner;
use crate::status::{InstallStatus, StatusPublisher};

/// Everything a pipeline run needs, built once at startup and shared by all runs.
pub struct ServiceContext {
    inventory: InventoryWriter,
    playbooks: PlaybookSelector,
    runner: PlaybookRunner,
    publisher: Arc<dyn StatusPublisher>,
    shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(
        config: &WorkerConfig,
        publisher: Arc<dyn StatusPublisher>,
        shutdown: CancellationToken,
    ) -> Self {
        let runner = PlaybookRunner::new(
            config.ansible.command.clone(),
            config.ansible.timeout(),
            config.ansible.max_output_bytes,
        )
        .with_kill_grace(config.ansible.kill_grace());
        Self {
            inventory: InventoryWriter::new(&config.inventory_dir),
            playbooks: PlaybookSelector::new(&config.playbook_dir),
            runner,
            publisher,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn playbooks(&self) -> &PlaybookSelector {
        &self.playbooks
    }

    pub fn publisher(&self) -> &Arc<dyn StatusPublisher> {
        &self.publisher
    }

    /// Runs the whole pipeline for one payload and publishes exactly one status.
    pub async fn handle_message(&self, payload: &[u8]) -> InstallStatus {
        let run_id = Uuid::new_v4();
        let span = info_span!("install", %run_id, id = tracing::field::Empty);
        self.handle_in_span(payload, &span).instrument(span.clone()).await
    }

    async fn handle_in_span(&self, payload: &[u8], span: &tracing::Span) -> InstallStatus {
        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "dropping undecodable request");
                return self.publish(InstallStatus::rejected(0, "", None, &err)).await;
            }
        };
        span.record("id", request.id);
        let (id, name) = (request.id, request.name.clone());
        info!(name = %name, db_type = %request.db_type, "received install request");

        let request = match request.validate() {
            Ok(request) => request,
            Err(err) => {
                let err = ProvisionError::from(err);
                warn!(kind = err.kind(), error = %err, "invalid install request");
                return self.publish(InstallStatus::rejected(id, name, None, &err)).await;
            }
        };

        let inventory = match self.inventory.write(&request) {
            Ok(inventory) => inventory,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "inventory not written");
                return self.publish(InstallStatus::rejected(id, name, None, &err)).await;
            }
        };

        let status = self.execute(&request, &inventory).await;
        let status = self.publish(status).await;
        drop(inventory);
        status
    }

    async fn execute(&self, request: &ValidatedRequest, inventory: &InventoryFile) -> InstallStatus {
        let (id, name) = (request.id, request.name.as_str());
        let playbook = match self.playbooks.select(&request.db_type_tag) {
            Ok(playbook) => playbook,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "no playbook for request");
                return InstallStatus::rejected(id, name, Some(inventory.path()), &err);
            }
        };

        match self
            .runner
            .run(inventory.path(), &playbook, &self.shutdown)
            .await
        {
            Ok(run) => {
                match run.error() {
                    None => info!(elapsed_ms = run.elapsed.as_millis() as u64, "playbook succeeded"),
                    Some(err) => warn!(
                        kind = err.kind(),
                        exit_code = run.exit_code,
                        error = %err,
                        "playbook failed"
                    ),
                }
                InstallStatus::from_run(id, name, inventory.path(), &run)
            }
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "playbook not run");
                InstallStatus::rejected(id, name, Some(inventory.path()), &err)
            }
        }
    }

    /// Publish failures are logged and swallowed; the run is already over.
    async fn publish(&self, status: InstallStatus) -> InstallStatus {
        match self.publisher.publish(&status).await {
            Ok(()) => info!(
                id = status.id,
                name = %status.name,
                status = ?status.status,
                exit_code = status.ansible_exit_code,
                "status published"
            ),
            Err(err) => warn!(kind = err.kind(), error = %err, "status not published"),
        }
        status
    }
}
