use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{LogFormat, LoggingConfig};

pub const LOG_FILE_NAME: &str = "worker.log";

/// Installs the global subscriber. Returns the log directory actually used,
/// or `None` when logging to stderr.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|err| anyhow::anyhow!("invalid log level '{}': {err}", config.level))?;

    let (writer, used_dir) = match &config.dir {
        Some(dir) => {
            let (file, used) = open_with_fallback(dir)?;
            (BoxMakeWriter::new(Mutex::new(file)), Some(used))
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(used_dir.is_none());
    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("unable to install logger: {err}"))?;
    Ok(used_dir)
}

fn open_with_fallback(log_dir: &Path) -> anyhow::Result<(File, PathBuf)> {
    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("logs");

    let mut candidates = vec![log_dir.to_path_buf()];
    if fallback != log_dir {
        candidates.push(fallback);
    }

    let mut last_error: Option<(PathBuf, io::Error)> = None;
    for candidate in candidates {
        match open_log_file(&candidate) {
            Ok(file) => {
                if candidate != log_dir {
                    eprintln!(
                        "unable to write {LOG_FILE_NAME} at {}; falling back to {}",
                        log_dir.display(),
                        candidate.display()
                    );
                }
                return Ok((file, candidate));
            }
            Err(err) => last_error = Some((candidate, err)),
        }
    }

    match last_error {
        Some((path, err)) => Err(anyhow::anyhow!(
            "unable to open worker log at {}: {}",
            path.display(),
            err
        )),
        None => anyhow::bail!("unable to initialize worker log"),
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))
}
