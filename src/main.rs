use clap::Parser;
use db_install_worker::cli;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli.run()
}
