//! Short-lived ansible inventory files.
//!
//! An inventory carries the target host and every credential in plain text, so
//! it only ever exists behind an [`InventoryFile`] guard that deletes it when
//! dropped.

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::request::ValidatedRequest;

const NAME_PREFIX: &str = "db_";

#[derive(Clone, Debug)]
pub struct InventoryWriter {
    dir: PathBuf,
}

impl InventoryWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, request: &ValidatedRequest) -> Result<InventoryFile, ProvisionError> {
        create_private_dir(&self.dir).map_err(|source| ProvisionError::InventoryWrite {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(inventory_file_name(request.id, &request.name));
        let line = render_inventory_line(request);
        if let Err(source) = write_private_file(&path, line.as_bytes()) {
            return Err(ProvisionError::InventoryWrite { path, source });
        }
        debug!(id = request.id, path = %path.display(), "wrote inventory");
        Ok(InventoryFile { path })
    }
}

/// Removes the inventory when dropped.
#[derive(Debug)]
pub struct InventoryFile {
    path: PathBuf,
}

impl InventoryFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InventoryFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed inventory"),
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove inventory"
            ),
        }
    }
}

/// `"DB PostgreSQL HiTeman-Prod"` becomes `"db_postgresql_hiteman_prod"`.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch == ' ' || ch == '-' { '_' } else { ch })
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '_')
        .collect();
    if sanitized.starts_with(NAME_PREFIX) {
        sanitized
    } else {
        format!("{NAME_PREFIX}{sanitized}")
    }
}

/// The run tag keeps redelivered copies of the same request apart.
pub fn inventory_file_name(id: i64, name: &str) -> String {
    let run = Uuid::new_v4().simple().to_string();
    format!("vm_{id}_{}_{}.ini", sanitize_name(name), &run[..8])
}

pub fn render_inventory_line(request: &ValidatedRequest) -> String {
    format!(
        "{} ansible_user={} ansible_password={} db_name={} db_user={} db_password={}\n",
        request.ip_address,
        request.vm_user,
        request.vm_password,
        request.db_name,
        request.db_user,
        request.db_password
    )
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    // A failed open leaves whatever is at `path` alone; it is not ours.
    let mut file = options.open(path)?;
    let written = file.write_all(contents).and_then(|()| file.sync_all());
    if written.is_err() {
        drop(file);
        if let Err(err) = std::fs::remove_file(path) {
            warn!(
                path = %path.display(),
                error = %err,
                "failed to remove partial inventory"
            );
        }
    }
    written
}
