//! Outbound status messages and the publishers that deliver them.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::runner::PlaybookRun;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallStatus {
    pub id: i64,
    pub name: String,
    pub status: StatusKind,
    #[serde(default)]
    pub inventory: String,
    #[serde(default)]
    pub ansible_exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ansible_output: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InstallStatus {
    /// Status for a request that never reached the tool.
    pub fn rejected(
        id: i64,
        name: impl Into<String>,
        inventory: Option<&Path>,
        error: &ProvisionError,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status: StatusKind::Error,
            inventory: inventory_string(inventory),
            ansible_exit_code: error.exit_code().unwrap_or(0),
            ansible_output: String::new(),
            timestamp: Utc::now(),
            error: Some(error.to_string()),
        }
    }

    pub fn from_run(id: i64, name: impl Into<String>, inventory: &Path, run: &PlaybookRun) -> Self {
        let error = run.error();
        Self {
            id,
            name: name.into(),
            status: if error.is_none() {
                StatusKind::Success
            } else {
                StatusKind::Error
            },
            inventory: inventory_string(Some(inventory)),
            ansible_exit_code: run.exit_code,
            ansible_output: run.output.clone(),
            timestamp: Utc::now(),
            error: error.map(|err| err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusKind::Success
    }
}

fn inventory_string(inventory: Option<&Path>) -> String {
    inventory
        .map(|path| path.display().to_string())
        .unwrap_or_default()
}

#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, status: &InstallStatus) -> Result<(), ProvisionError>;

    /// Waits until every published status has left the process.
    async fn flush(&self) -> Result<(), ProvisionError> {
        Ok(())
    }
}

pub struct NatsStatusPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsStatusPublisher {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl StatusPublisher for NatsStatusPublisher {
    async fn publish(&self, status: &InstallStatus) -> Result<(), ProvisionError> {
        let payload =
            serde_json::to_vec(status).map_err(|err| ProvisionError::Publish(err.to_string()))?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|err| ProvisionError::Publish(err.to_string()))
    }

    async fn flush(&self) -> Result<(), ProvisionError> {
        self.client
            .flush()
            .await
            .map_err(|err| ProvisionError::Publish(err.to_string()))
    }
}

/// Writes one JSON document per line, e.g. to stdout for local runs.
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> StatusPublisher for JsonLinesPublisher<W> {
    async fn publish(&self, status: &InstallStatus) -> Result<(), ProvisionError> {
        let line =
            serde_json::to_string(status).map_err(|err| ProvisionError::Publish(err.to_string()))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ProvisionError::Publish("status writer poisoned".to_string()))?;
        writeln!(writer, "{line}").map_err(|err| ProvisionError::Publish(err.to_string()))
    }

    async fn flush(&self) -> Result<(), ProvisionError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ProvisionError::Publish("status writer poisoned".to_string()))?;
        writer
            .flush()
            .map_err(|err| ProvisionError::Publish(err.to_string()))
    }
}
