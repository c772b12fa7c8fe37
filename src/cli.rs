use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{self, WorkerConfig};
use crate::logging;
use crate::pipeline::ServiceContext;
use crate::playbook::DbType;
use crate::signals::{ShutdownSignals, spawn_shutdown_watcher};
use crate::status::JsonLinesPublisher;
use crate::worker;

#[derive(Parser)]
#[command(name = "db-install-worker")]
#[command(about = "Runs ansible playbooks for database install requests from NATS", version)]
pub struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
    Handle(HandleArgs),
    Check(CheckArgs),
}

#[derive(Args, Clone, Debug)]
struct CommonArgs {
    /// Worker configuration file (YAML). Missing file means defaults.
    #[arg(long, global = true, default_value = "worker.yaml")]
    config: PathBuf,
    /// Overrides bus.url and NATS_URL.
    #[arg(long, global = true)]
    nats_url: Option<String>,
    #[arg(long, global = true)]
    inventory_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    playbook_dir: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    about = "Start the worker and serve install requests until SIGTERM.",
    long_about = "Connects to NATS, joins the install queue group and runs one playbook per request, publishing a status for each.",
    after_help = "Main options:\n  (none)\n\nOptional options:\n  --config <PATH> (default: worker.yaml)\n  --nats-url <URL> (default: $NATS_URL or nats://127.0.0.1:4222)"
)]
struct RunArgs {}

#[derive(Parser)]
#[command(
    about = "Run a single install request locally and print its status.",
    long_about = "Reads one request JSON document, runs it through the same pipeline as the worker and prints the status JSON line on stdout. No bus connection is made.",
    after_help = "Main options:\n  <REQUEST> path to a request JSON file, or - for stdin"
)]
struct HandleArgs {
    request: PathBuf,
}

#[derive(Parser)]
#[command(
    about = "Validate the configuration and the playbook table.",
    after_help = "Exits non-zero when the config is invalid or a mapped playbook is missing."
)]
struct CheckArgs {}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let config = self.common.resolve_config()?;
        match self.command {
            Command::Run(args) => args.run(config),
            Command::Handle(args) => args.run(config),
            Command::Check(args) => args.run(config),
        }
    }
}

impl CommonArgs {
    fn resolve_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = config::load_worker_config(Some(&self.config))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        if let Some(url) = &self.nats_url {
            config.bus.url = url.clone();
        }
        if let Some(dir) = &self.inventory_dir {
            config.inventory_dir = dir.clone();
        }
        if let Some(dir) = &self.playbook_dir {
            config.playbook_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

impl RunArgs {
    fn run(self, config: WorkerConfig) -> anyhow::Result<()> {
        logging::init(&config.logging)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        runtime.block_on(worker::run(config))
    }
}

impl HandleArgs {
    fn run(self, config: WorkerConfig) -> anyhow::Result<()> {
        let mut logging = config.logging.clone();
        logging.dir = None;
        logging::init(&logging)?;

        let payload = if self.request.as_os_str() == "-" {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read request from stdin")?;
            buf
        } else {
            std::fs::read(&self.request)
                .with_context(|| format!("failed to read {}", self.request.display()))?
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        let status = runtime.block_on(async {
            let shutdown = CancellationToken::new();
            let signals = ShutdownSignals::register()
                .context("failed to register shutdown signal handlers")?;
            spawn_shutdown_watcher(signals, shutdown.clone());
            let publisher = Arc::new(JsonLinesPublisher::new(std::io::stdout()));
            let ctx = ServiceContext::new(&config, publisher, shutdown);
            let status = ctx.handle_message(&payload).await;
            ctx.publisher()
                .flush()
                .await
                .context("failed to flush status output")?;
            anyhow::Ok(status)
        })?;
        if !status.is_success() {
            anyhow::bail!(
                "install request {} failed: {}",
                status.id,
                status.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}

impl CheckArgs {
    fn run(self, config: WorkerConfig) -> anyhow::Result<()> {
        println!("bus: {} ({})", config.bus.url, config.bus.install_subject);
        println!("inventory dir: {}", config.inventory_dir.display());
        println!("playbook dir: {}", config.playbook_dir.display());
        let selector = crate::playbook::PlaybookSelector::new(&config.playbook_dir);
        for db_type in DbType::ALL {
            println!("  {db_type} -> {}", selector.path_for(*db_type).display());
        }
        let missing = selector.missing_playbooks();
        if !missing.is_empty() {
            let list = missing
                .iter()
                .map(|(db_type, path)| format!("{db_type} ({})", path.display()))
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::bail!("missing playbooks: {list}");
        }
        println!("configuration ok");
        Ok(())
    }
}
