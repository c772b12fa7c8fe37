#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use db_install_worker::config::WorkerConfig;
use db_install_worker::{InstallStatus, ProvisionError, StatusPublisher};
use tempfile::TempDir;

#[derive(Default)]
pub struct RecordingPublisher {
    statuses: Mutex<Vec<InstallStatus>>,
}

impl RecordingPublisher {
    pub fn statuses(&self) -> Vec<InstallStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish(&self, status: &InstallStatus) -> Result<(), ProvisionError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

/// Rejects every status, counting the attempts.
#[derive(Default)]
pub struct FailingPublisher {
    attempts: AtomicUsize,
}

impl FailingPublisher {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusPublisher for FailingPublisher {
    async fn publish(&self, _status: &InstallStatus) -> Result<(), ProvisionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProvisionError::Publish("no route to bus".to_string()))
    }
}

/// Temp layout with an inventory dir, a playbook dir holding `postgresql.yml`
/// and a shell script standing in for `ansible-playbook`.
pub struct Fixture {
    root: TempDir,
    pub config: WorkerConfig,
}

impl Fixture {
    pub fn new(tool_body: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let inventory_dir = root.path().join("inventories");
        let playbook_dir = root.path().join("playbooks");
        std::fs::create_dir_all(&playbook_dir).unwrap();
        std::fs::write(playbook_dir.join("postgresql.yml"), "- hosts: all\n").unwrap();

        let tool = root.path().join("fake-ansible.sh");
        std::fs::write(&tool, format!("#!/bin/sh\n{tool_body}\n")).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = WorkerConfig::default();
        config.inventory_dir = inventory_dir;
        config.playbook_dir = playbook_dir;
        config.ansible.command = vec!["sh".to_string(), tool.display().to_string()];
        config.ansible.kill_grace_ms = 200;
        Self { root, config }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn inventory_entries(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.config.inventory_dir) {
            Ok(entries) => entries.map(|entry| entry.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn request_json(id: i64, name: &str, ip: &str, db_type: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "id": id,
        "name": name,
        "ip_address": ip,
        "vm_user": "ubuntu",
        "vm_password": "vm-secret",
        "db_type": db_type,
        "db_user": "app",
        "db_password": "db-secret",
        "db_name": "appdb",
    }))
    .unwrap()
}

pub fn publisher() -> Arc<RecordingPublisher> {
    Arc::new(RecordingPublisher::default())
}
