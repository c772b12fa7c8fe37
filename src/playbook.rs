//! Database type to playbook mapping.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ProvisionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbType {
    Postgresql,
}

impl DbType {
    pub const ALL: &'static [DbType] = &[DbType::Postgresql];

    /// Resolves a request tag, trimmed and case-insensitive, including aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Some(Self::Postgresql),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
        }
    }

    pub fn playbook_file(self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql.yml",
        }
    }

    /// Comma separated list of canonical names, for error messages.
    pub fn supported() -> String {
        Self::ALL
            .iter()
            .map(|db_type| db_type.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct PlaybookSelector {
    playbook_dir: PathBuf,
}

impl PlaybookSelector {
    pub fn new(playbook_dir: impl Into<PathBuf>) -> Self {
        Self {
            playbook_dir: playbook_dir.into(),
        }
    }

    pub fn playbook_dir(&self) -> &Path {
        &self.playbook_dir
    }

    pub fn path_for(&self, db_type: DbType) -> PathBuf {
        self.playbook_dir.join(db_type.playbook_file())
    }

    pub fn select(&self, db_type: &str) -> Result<PathBuf, ProvisionError> {
        let resolved = DbType::parse(db_type).ok_or_else(|| ProvisionError::UnsupportedDbType {
            db_type: db_type.to_string(),
        })?;
        Ok(self.path_for(resolved))
    }

    /// Mapped types whose playbook file does not exist on disk.
    pub fn missing_playbooks(&self) -> Vec<(DbType, PathBuf)> {
        DbType::ALL
            .iter()
            .map(|db_type| (*db_type, self.path_for(*db_type)))
            .filter(|(_, path)| !path.is_file())
            .collect()
    }
}
