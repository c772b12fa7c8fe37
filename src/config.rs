use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default = "default_inventory_dir")]
    pub inventory_dir: PathBuf,
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,
    #[serde(default)]
    pub ansible: AnsibleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            inventory_dir: default_inventory_dir(),
            playbook_dir: default_playbook_dir(),
            ansible: AnsibleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_install_subject")]
    pub install_subject: String,
    #[serde(default = "default_status_subject")]
    pub status_subject: String,
    #[serde(default = "default_queue_group")]
    pub queue_group: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            client_name: default_client_name(),
            install_subject: default_install_subject(),
            status_subject: default_status_subject(),
            queue_group: default_queue_group(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AnsibleConfig {
    /// Program plus fixed leading arguments; `-i <inventory> <playbook>` is appended.
    #[serde(default = "default_ansible_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            command: default_ansible_command(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl AnsibleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Write `worker.log` here instead of stderr.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bus.url.trim().is_empty() {
            anyhow::bail!("bus.url cannot be empty");
        }
        for (field, value) in [
            ("bus.install_subject", &self.bus.install_subject),
            ("bus.status_subject", &self.bus.status_subject),
            ("bus.queue_group", &self.bus.queue_group),
        ] {
            if value.trim().is_empty() || value.contains(char::is_whitespace) {
                anyhow::bail!("{field} must be a non-empty subject without whitespace");
            }
        }
        if self.bus.install_subject == self.bus.status_subject {
            anyhow::bail!("bus.install_subject and bus.status_subject must differ");
        }
        match self.ansible.command.first() {
            Some(program) if !program.trim().is_empty() => {}
            _ => anyhow::bail!("ansible.command must name a program"),
        }
        if self.ansible.timeout_secs == 0 {
            anyhow::bail!("ansible.timeout_secs must be greater than zero");
        }
        if self.ansible.max_output_bytes == 0 {
            anyhow::bail!("ansible.max_output_bytes must be greater than zero");
        }
        Ok(())
    }

    /// Applies overrides from a variable lookup (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("NATS_URL")
            && !url.trim().is_empty()
        {
            self.bus.url = url;
        }
    }
}

/// Loads the worker config; a missing or comment-only file yields defaults.
pub fn load_worker_config(path: Option<&Path>) -> anyhow::Result<WorkerConfig> {
    let Some(path) = path else {
        return Ok(WorkerConfig::default());
    };
    if !path.exists() {
        return Ok(WorkerConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_worker_config(&contents).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse_worker_config(contents: &str) -> anyhow::Result<WorkerConfig> {
    if contents
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
    {
        return Ok(WorkerConfig::default());
    }
    let config: WorkerConfig = serde_yaml_bw::from_str(contents)?;
    Ok(config)
}

fn default_nats_url() -> String {
    DEFAULT_NATS_URL.to_string()
}

fn default_client_name() -> String {
    "db-install-worker".to_string()
}

fn default_install_subject() -> String {
    "db.install".to_string()
}

fn default_status_subject() -> String {
    "db.install.status".to_string()
}

fn default_queue_group() -> String {
    "db-install-workers".to_string()
}

fn default_inventory_dir() -> PathBuf {
    PathBuf::from("inventories")
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("playbooks")
}

fn default_ansible_command() -> Vec<String> {
    vec!["ansible-playbook".to_string()]
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_output_bytes() -> usize {
    10_000
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_worker_conventions() {
        let config = WorkerConfig::default();
        assert_eq!(config.bus.url, DEFAULT_NATS_URL);
        assert_eq!(config.bus.install_subject, "db.install");
        assert_eq!(config.bus.status_subject, "db.install.status");
        assert_eq!(config.bus.queue_group, "db-install-workers");
        assert_eq!(config.ansible.timeout(), Duration::from_secs(1800));
        assert_eq!(config.ansible.max_output_bytes, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_yaml() {
        let config = parse_worker_config(
            r#"
bus:
  url: nats://bus.internal:4222
inventory_dir: /run/db-install/inventories
ansible:
  command: ["ansible-playbook", "--diff"]
  timeout_secs: 600
logging:
  format: json
"#,
        )
        .unwrap();
        assert_eq!(config.bus.url, "nats://bus.internal:4222");
        assert_eq!(config.bus.status_subject, "db.install.status");
        assert_eq!(
            config.inventory_dir,
            PathBuf::from("/run/db-install/inventories")
        );
        assert_eq!(config.playbook_dir, PathBuf::from("playbooks"));
        assert_eq!(config.ansible.command.len(), 2);
        assert_eq!(config.ansible.timeout_secs, 600);
        assert_eq!(config.ansible.max_output_bytes, 10_000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn comment_only_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("worker.yaml");
        std::fs::write(&path, "# nothing configured yet\n\n")?;
        let config = load_worker_config(Some(&path))?;
        assert_eq!(config.bus.url, DEFAULT_NATS_URL);

        let missing = load_worker_config(Some(&dir.path().join("absent.yaml")))?;
        assert_eq!(missing.inventory_dir, PathBuf::from("inventories"));
        Ok(())
    }

    #[test]
    fn env_override_replaces_bus_url() {
        let mut config = WorkerConfig::default();
        config.apply_env_overrides(|key| match key {
            "NATS_URL" => Some("nats://10.0.0.9:4222".to_string()),
            _ => None,
        });
        assert_eq!(config.bus.url, "nats://10.0.0.9:4222");

        config.apply_env_overrides(|_| Some("  ".to_string()));
        assert_eq!(config.bus.url, "nats://10.0.0.9:4222");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = WorkerConfig::default();
        config.ansible.command.clear();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.bus.status_subject = config.bus.install_subject.clone();
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.ansible.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.bus.queue_group = "db workers".to_string();
        assert!(config.validate().is_err());
    }
}
